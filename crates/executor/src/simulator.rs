//! Side-effect free executor used for dry runs and as the auto-mode fallback.

use crate::outcome::{ActionExecutor, ActionOutcome};
use async_trait::async_trait;
use deskpilot_core::Params;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatorExecutor;

#[async_trait]
impl ActionExecutor for SimulatorExecutor {
    fn name(&self) -> &'static str {
        "simulator"
    }

    async fn execute(&self, action: &str, params: &Params) -> ActionOutcome {
        debug!("Simulating {}", action);
        ActionOutcome::ok(json!({
            "simulated": true,
            "action": action,
            "params": params,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulator_echoes_action() {
        let mut params = Params::new();
        params.insert("application".into(), json!("firefox"));
        let outcome = SimulatorExecutor.execute("open_application", &params).await;
        assert!(outcome.success);
        let output = outcome.output.unwrap();
        assert_eq!(output["action"], "open_application");
        assert_eq!(output["params"]["application"], "firefox");
    }

    #[tokio::test]
    async fn test_simulator_accepts_anything() {
        let outcome = SimulatorExecutor.execute("teleport", &Params::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.describe(), "ok");
    }
}

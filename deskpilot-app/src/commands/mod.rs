pub mod agent;
pub mod cli;
pub mod history;
pub mod run;

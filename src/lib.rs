pub mod agent;
pub mod aggregate;
pub mod cli;
pub mod config;
pub mod diff_lines;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod forge;
pub mod history;
pub mod jobs;
pub mod process;
pub mod prompts;
pub mod reporter;
pub mod review_schema;
pub mod status;
pub mod store;

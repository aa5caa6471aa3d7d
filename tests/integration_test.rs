mod common;
mod fanout_scenarios;
mod relay_pipeline;

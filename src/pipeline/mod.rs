mod driver;

pub use driver::{PipelineDriver, RunSummary};

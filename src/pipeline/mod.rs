mod batch;
mod executor;
mod halt;
mod prompts;
mod summary;

pub use batch::{BatchReport, BatchRunner};
pub use executor::PipelineExecutor;
pub use halt::{HaltCause, HaltSignal, STOP_FILENAME};
pub use prompts::DefaultPrompts;
pub use summary::build_summary;

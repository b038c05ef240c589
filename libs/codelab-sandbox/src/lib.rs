pub mod analyzer;
pub mod cancel;
pub mod classifier;
pub mod comparator;
pub mod engine;
pub mod environment;
pub mod evaluator;
pub mod harness;
pub mod orchestrator;
pub mod realm;
pub mod service;
pub mod worker;


pub use cancel::CancellationToken;
pub use realm::RequestError;
pub use service::Harness;
pub use worker::WorkerCommand;

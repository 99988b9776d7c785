pub mod evaluator;
pub mod notify;

pub use evaluator::AlertEvaluator;
pub use notify::MultiSender;

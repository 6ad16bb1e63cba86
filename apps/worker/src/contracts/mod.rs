pub mod attempt_outcome;

pub use attempt_outcome::AttemptOutcome;

//! Proof-of-work checks and difficulty retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, get_next_work_required, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};

//! Signed Merkle checkpoints over submitted evidence.
//!
//! On each run the engine drains the evidence leaves recorded since the
//! previous checkpoint, builds a Merkle tree over them in append order,
//! signs the root with a P-256 key and persists the result as its own
//! immutable object linked to the previous checkpoint.

pub mod engine;
pub mod merkle;
pub mod scheduler;
pub mod signer;

pub use engine::{
    verify_checkpoint, verify_checkpoint_chain, Checkpoint, CheckpointEngine, CHECKPOINT_PREFIX,
};
pub use merkle::{build_proof, merkle_root, verify_proof, InclusionProof, ProofStep, Side};
pub use scheduler::CheckpointScheduler;
pub use signer::{signing_message, verify_signature, CheckpointSigner};

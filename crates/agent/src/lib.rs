//! Turn Runtime - dialogue orchestration over the conversation core
//!
//! This crate is the "brain" of the parley system - the runtime that:
//! - Assembles prompts and calls the model provider (`prompt`, `llm`)
//! - Extracts deterministic discovery context from utterances (`discovery`)
//! - Enforces the output ruleset with a regenerate-once policy (`gate`)
//! - Executes embedded directives against collaborators (`effects`)
//! - Wires one inbound turn end to end (`runtime`)
//!
//! # Architecture
//!
//! One turn follows a constrained loop:
//! 1. **Routing** - resolve the surface and resume/create the session
//! 2. **Drafting** (`prompt` + `llm`) - single blocking provider call
//! 3. **Parsing** - split the draft into visible text and directives
//! 4. **Enforcement** (`gate`) - validate the visible text, regenerate once
//! 5. **Response** - return while `effects` runs directives detached
//!
//! # Safety Principle
//!
//! The model is strictly a drafting engine. It NEVER binds identities,
//! mutates tenant records, or moves lifecycle state directly. Those are
//! deterministic decisions made by the orchestration core from parsed,
//! validated directives.

pub mod discovery;
pub mod effects;
pub mod gate;
pub mod llm;
pub mod prompt;
pub mod render;
pub mod runtime;

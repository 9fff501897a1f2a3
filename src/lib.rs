//! This library provides the exchange orchestration engine of [OpenCred], a service that lets
//! relying parties verify a holder's digital credentials.
//!
//! [OpenCred]: <https://github.com/digitalbazaar/opencred>
//!
//! An *exchange* is one verification session. It is created for a relying party, walks
//! through the steps of that relying party's workflow (each step asking the holder for a
//! presentation), and ends either `complete`, with claims ready for an id_token, or
//! `invalid`.
//!
//! # Usage
//!
//! ```ignore
//! use opencred_exchange::engine::{session::MemoryStore, AdvanceOutcome, Engine};
//! use opencred_exchange::core::exchange::Audience;
//!
//! // Setup the engine.
//! let engine = Engine::builder()
//!     .with_config(config)
//!     .with_session_store(Arc::new(MemoryStore::default()))
//!     .with_presentation_verifier(verifier)
//!     .build()?;
//!
//! // Start an exchange and hand the presentation request to the holder.
//! let created = engine.create_exchange("my-client-id").await?;
//!
//! // Submit the holder's presentation for the current step.
//! match engine.advance(created.id, created.sequence, &presentation).await? {
//!     AdvanceOutcome::Next { exchange } => { /* ask for the next presentation */ }
//!     AdvanceOutcome::Complete { claims, .. } => { /* issue the id_token */ }
//!     AdvanceOutcome::Waiting { .. } => { /* poll again later */ }
//! }
//!
//! // Relying parties may read the exchange back, including its recorded results.
//! let view = engine.get_exchange(created.id, Audience::RelyingParty).await?;
//! ```
//!
//! # Workflows
//!
//! Each relying party is configured with one [`Workflow`]:
//! - **native**: a graph of steps evaluated by this library. Presentations are checked by a
//!   [`PresentationVerifier`] supplied by the application, and branches are chosen by a
//!   [`BranchPredicate`].
//! - **vc-api**: a remote VC-API exchanger, polled until it reports a result.
//! - **microsoft-entra-verified-id**: Microsoft Entra Verified ID, which reports back through
//!   callbacks that the application passes to [`Engine::advance`].
//!
//! [`Workflow`]: crate::core::workflow::Workflow
//! [`PresentationVerifier`]: crate::engine::adapter::PresentationVerifier
//! [`BranchPredicate`]: crate::engine::adapter::BranchPredicate
//! [`Engine::advance`]: crate::engine::Engine::advance
//!
//! # Concurrency
//!
//! Exchanges live in a [`SessionStore`]. Every transition is a single compare-and-write on
//! the exchange's `sequence`, so concurrent advances from the same observed state resolve to
//! exactly one winner and any number of engine instances may share a store.
//!
//! [`SessionStore`]: crate::engine::session::SessionStore

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod utils;

pub use engine::{AdvanceOutcome, CreatedExchange, Engine, EngineBuilder, IdTokenClaims};
pub use error::ExchangeError;

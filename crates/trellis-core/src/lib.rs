//! # Trellis Core
//!
//! Runtime primitives shared by the Trellis overlay.
//!
//! This crate contains **no networking code**. It provides the pieces the
//! networking layer builds its orchestration on:
//!
//! - **Contexts** (`context` module): a cancellation token plus deadline that
//!   every suspension point races against. Cancelling a node's root context
//!   cascades to everything the node started.
//!
//! - **Event queues** (`events` module): bounded multi-producer queues with an
//!   explicit `Open` / `Draining` / `Closed` state, used to fan dial results
//!   into a single consumer.
//!
//! - **Secrets** (`secret` module): the 32-byte private network key.
//!
//! - **Group setup** (`group` module): start `n` instances concurrently and
//!   fail fast.
//!
//! ## Usage
//!
//! ```ignore
//! use trellis_core::{setup_group, Context, Secret};
//! ```

pub mod context;
pub mod events;
pub mod group;
pub mod secret;

pub use context::{Context, ContextError};
pub use events::{channel as event_channel, EmitError, EventSender, EventStream, StreamState};
pub use group::{setup_group, Live, SetupError};
pub use secret::{Secret, SecretError, SECRET_LEN};

//! Component sandbox
//!
//! Runs untrusted UI components in an isolated context and mediates every
//! side effect they attempt through a capability broker.
//!
//!  - [`sandbox`] holds the supervisor side: sessions, the broker, the
//!    permission model and the isolation host, plus the guest runtime that
//!    lives on the far side of the frame channel.
//!  - [`editing`] is the reversible edit engine used to apply generated DOM
//!    changes to a page, over the in-memory tree in [`core::dom`].
//!
//! The supervisor expects a multi-thread tokio runtime. Guests run on their
//! own current-thread runtime inside a `LocalSet` and never share memory
//! with the supervisor; only JSON frames cross.

pub mod core;
pub mod editing;
pub mod sandbox;

pub use crate::core::dom::{Document, DocumentError, NodeId};
pub use editing::{EditConfig, EditEngine, EditError, EditOperation, InsertPosition};
pub use sandbox::broker::{
    BrokerError, CapabilityBroker, ChannelPrompter, HostFacilities, PendingPrompt,
    PermissionPrompter, StaticPrompter,
};
pub use sandbox::guest::{Component, ComponentCompiler, ComponentError, GuestState, SandboxGlobals};
pub use sandbox::permissions::{Capability, PermissionDecision, PermissionRule};
pub use sandbox::process::{GuestProgram, IsolationBackend};
pub use sandbox::session::{SandboxSession, SessionOptions};
pub use sandbox::{SandboxConfig, SandboxError, SandboxManager};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # chanio - Buffered, Encoding-Aware Channel I/O
//!
//! `chanio` is a sans-IO channel core: a buffered, encoding-aware,
//! event-driven I/O layer that sits between an application and its
//! transports. It separates everything a stream of bytes needs on its way
//! to becoming text (buffering, end-of-line translation, character-set
//! conversion, transparent filter stacking, readiness notification,
//! background flushing and copying) from the transport itself, which is
//! supplied as a small [`Driver`] implementation.
//!
//! ## Core Concepts
//!
//! ### Channel
//!
//! The [`Channel`] is the fundamental abstraction: a stable handle over a
//! retargetable binding of driver, buffer queues, and conversion state.
//! Reads pull raw bytes through decoding and EOL translation; writes push
//! text or bytes through translation and encoding into buffers that are
//! flushed by policy ([`BufferMode`]) or drained in the background when
//! the transport pushes back.
//!
//! ### Driver
//!
//! A [`Driver`] is the pluggable transport under a channel: a handful of
//! synchronous entry points (input, output, close, seek, blocking mode,
//! watch). Everything else is layered on top by the channel core, so a
//! transport implementation stays small and testable.
//!
//! ### Stacking
//!
//! A filter channel can be pushed in front of an existing channel with
//! [`Channel::stack`], transparently: every holder of the handle now
//! talks through the filter, and [`Channel::unstack`] restores the
//! covered channel, byte for byte, when no I/O happened in between.
//!
//! ### Events
//!
//! Channels compute the readiness interest they need after every
//! operation and hand it to the driver's `watch`. An embedding event
//! loop reports readiness back through [`notify_channel`]; the
//! [`IoContext`] carries the zero-delay timers that keep already-buffered
//! input from starving while the loop waits on the OS.
//!
//! ## Data Flow
//!
//! ```text
//!        write()/write_text()                read()/read_line()
//!               |                                  /|\
//!              \|/                                  |
//!   +---------------------+            +-----------------------+
//!   |   EOL translation   |            |    EOL translation    |
//!   +---------------------+            +-----------------------+
//!               |                                  /|\
//!              \|/                                  |
//!   +---------------------+            +-----------------------+
//!   |      encoding       |            |       decoding        |
//!   +---------------------+            +-----------------------+
//!               |                                  /|\
//!              \|/                                  |
//!   +---------------------+            +-----------------------+
//!   |    output queue     |            |      input queue      |
//!   +---------------------+            +-----------------------+
//!               |                                  /|\
//!              \|/                                  |
//!   +-------------------------------------------------------------+
//!   |                     Driver (transport)                      |
//!   +-------------------------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use chanio::{IoContext, Ready, Translation};
//!
//! let ctx = IoContext::new();
//! let chan = ctx.open("conn0", driver, Ready::READABLE | Ready::WRITABLE)?;
//! chan.set_translation(Some(Translation::Auto), Some(Translation::CrLf));
//!
//! chan.write_text("hello\n")?;
//! while let Some(line) = chan.read_line()? {
//!     println!("got {line}");
//! }
//! ```
//!
//! ## Threading
//!
//! Channels use `Rc`, not `Arc`, and are single-threaded by design: one
//! cooperative event loop per thread, each with its own [`IoContext`].
//! "Asynchronous" here means event-loop-driven, never multi-threaded.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

// ========================================
// Module Declarations
// ========================================

/// Channel buffers and per-channel recycling
pub(crate) mod buffer;

/// The channel record, flags, and configuration surface
pub(crate) mod channel;

/// The per-thread registry, std slots, and readiness timers
pub(crate) mod context;

/// Background copying between channels
pub(crate) mod copy;

/// The transport contract
pub(crate) mod driver;

/// Character-set conversion
pub(crate) mod encoding;

/// Readiness handlers and event dispatch
pub(crate) mod events;

/// The read-side operations
pub(crate) mod input;

/// The write-side operations
pub(crate) mod output;

/// Seek and tell
pub(crate) mod seek;

/// Transparent filter stacking
pub(crate) mod stack;

/// End-of-line translation
pub(crate) mod translate;

// ========================================
// Public Exports
// ========================================

/// Channel handle and buffering policy
pub use channel::{BufferMode, Channel};

/// The per-thread I/O context and its standard stream slots
pub use context::{IoContext, StdStream};

/// Background copy entry point and its completion callback type
pub use copy::{copy_channel, CopyCallback};

/// Transport contract and readiness types
pub use driver::{Direction, Driver, Ready};

/// External text encodings
pub use encoding::TextEncoding;

/// Readiness dispatch and handler identifiers
pub use events::{notify_channel, HandlerId};

/// End-of-line conventions
pub use translate::Translation;

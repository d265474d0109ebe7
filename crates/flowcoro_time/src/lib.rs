// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Time primitives for the FlowCoro runtime.
//!
//! - [`Clock`]: a cloneable handle to a shared timer registry, backed by the monotonic system
//!   clock. Created through [`runtime::InactiveClock`], which splits into the clock handle and
//!   the [`runtime::ClockDriver`] that advances registered timers.
//! - [`Delay`]: a future that completes after a duration (the runtime exposes this as
//!   `sleep_for`).
//! - [`Timeout`]: races a future against a deadline; see [`FutureExt::with_timeout`].
//! - [`Stopwatch`]: elapsed-time measurement.
//! - [`Error`]: the time-layer error type. Introspection is limited.

// Public API surface.
mod clock;
mod delay;
mod error;
mod future_ext;
mod stopwatch;
mod timeout;
mod timers;

pub use clock::*;
pub use delay::*;
pub use error::*;
pub use future_ext::*;
pub use stopwatch::*;
pub use timeout::*;
pub use timers::*;

// Not re-exported at the root because the module name is an important identifying factor:
// these types are for whoever runs the event loop, not for task code.
pub mod runtime;

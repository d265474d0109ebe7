// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// The runtime does not attempt to recover from poisoned locks: a panic while holding one of our
/// internal mutexes means scheduler state may be inconsistent, and propagating the panic is the
/// only honest answer.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock";

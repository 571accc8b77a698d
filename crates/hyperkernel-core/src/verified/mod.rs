//! Pure functions extracted from the coherence and migration engines.
//!
//! Everything here takes values in and returns values out: no locks, no
//! transport, no clocks.  The imperative shell (`directory`, `transport`,
//! `membership`) delegates its arithmetic and legality checks to these
//! functions so they can be tested exhaustively over small domains.
//!
//! | Module      | Used by                                         |
//! |-------------|-------------------------------------------------|
//! | [`home`]    | `Membership::home_of`                            |
//! | [`backoff`] | `PeerClient::call`                               |
//! | [`state`]   | `PageDirectory::commit`, `VcpuTable` transitions |

pub mod backoff;
pub mod home;
pub mod state;

//! tether-agent: the endpoint agent binary's building blocks.
//!
//! Wiring, bottom to top: [`transport`] opens the Hub stream and owns the
//! single writer task; [`session`] runs one attempt (registration,
//! heartbeat, dispatch); [`exec`] and [`fileops`] handle computer-role
//! requests; [`browser`] bridges commands to the extension; [`supervisor`]
//! wraps it all in a reconnect loop; [`web`] exposes the management API.

pub mod browser;
pub mod cancel;
pub mod cli;
pub mod exec;
pub mod fileops;
pub mod session;
pub mod supervisor;
pub mod tools;
pub mod transport;
pub mod web;

//! Host process pieces for the negotiation runtime.
//!
//! Chat channels plug in through [`ingress::ChatTransport`].

pub mod bootstrap;
pub mod health;
pub mod ingress;
pub mod sweeper;

//! Non-Linux stand-in for the REDIRECT entrypoint: present for uniform
//! configuration and call sites, but every operation fails fast rather than
//! silently doing nothing. Mirrors the original implementation's
//! build-tag-gated fallback (`spec.md` §4.6).

use std::sync::Arc;

use crate::error::Error;
use crate::tunnel::Tunnel;

pub async fn start(_addr: String, _tunnel: Arc<Tunnel>) -> Result<(), Error> {
    Err(Error::Unsupported("the REDIRECT entrypoint"))
}

pub fn deploy(_listen_port: u16, _blacklist: &[String], _whitelist: &[String]) -> Result<(), Error> {
    Err(Error::Unsupported("iptables REDIRECT deployment"))
}

pub fn undeploy() {}

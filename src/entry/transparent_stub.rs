//! Non-Linux stand-in for the TPROXY entrypoint; see `redirect_stub.rs` for
//! the rationale.

use std::sync::Arc;

use crate::error::Error;
use crate::tunnel::Tunnel;

pub async fn start(_addr: String, _tunnel: Arc<Tunnel>) -> Result<(), Error> {
    Err(Error::Unsupported("the TPROXY entrypoint"))
}

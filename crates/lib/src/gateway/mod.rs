//! Gateway: HTTP endpoint that runs allowlisted commands for one authenticated caller.
//!
//! `POST /run` with `X-Admin-Token` and `{ "command", "args", "cwd" }`. Responses: 200 with
//! captured output, 401 bad token, 403 rejected (reason as text), 400 malformed body,
//! 405 any other method, 413 body over [`MAX_BODY_BYTES`].

mod protocol;
mod server;

pub use protocol::{RunRequest, RunResponse};
pub use server::{
    router, run_gateway, run_gateway_until, serve, GatewayState, RunError, MAX_BODY_BYTES, RUN_PATH,
};

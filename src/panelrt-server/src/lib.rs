//! The HTTP + WebSocket boundary (§6): wires `panelrt-core`'s orchestrator
//! and panel manager to axum. Kept deliberately thin — every behavior this
//! crate exposes is documented as a boundary concern in §6.1/§6.2, not part
//! of the core itself.

pub mod routes;
pub mod state;
pub mod ws;

pub use routes::router;
pub use state::AppState;

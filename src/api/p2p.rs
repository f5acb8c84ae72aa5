//! Point-to-point LoRa (reserved)
//!
//! The engine build in use exposes no raw-radio commands yet, so this
//! sub-facade carries no operations.

#[derive(Debug, Clone, Copy, Default)]
pub struct P2p;

impl P2p {
    pub fn is_available(&self) -> bool {
        false
    }
}

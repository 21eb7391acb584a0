//! Control-plane wire format.
//!
//! The runtime talks to the external memory coordinator over a stream of
//! fixed-size 32-byte messages. Both request and reply use [`CtrlMsg`]; a
//! statistics reply reuses the same 32 bytes as [`StatsMsg`]. The payload
//! portion of a message is a union keyed by the operation code, modeled here
//! as [`MemPayload`] and validated against the opcode at parse time.
//!
//! All fields are little-endian on the wire.

/// Size in bytes of every control-plane message.
pub const CTRL_MSG_SIZE: usize = 32;

// CtrlMsg and StatsMsg share the wire frame; a size drift in either is a
// protocol break.
const _: () = assert!(CTRL_MSG_SIZE == 8 + 4 + 4 + 16);
const _: () = assert!(CTRL_MSG_SIZE == 8 + 8 + 8 + 4 + 4);

/// Operation code of a control-plane message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlOpCode {
    /// Client connects to the coordinator.
    Connect = 0,
    /// Client disconnects.
    Disconnect = 1,
    /// Request a region within the client's limit.
    Alloc = 2,
    /// Request a region beyond the client's limit; the coordinator may
    /// reject.
    Overcommit = 3,
    /// Return a region to the coordinator.
    Free = 4,
    /// Coordinator-initiated limit update.
    UpdLimit = 5,
    /// Client-initiated limit update request.
    UpdLimitReq = 6,
    /// Coordinator demands the client surrender memory.
    ForceReclaim = 7,
    /// Coordinator polls client-side cache statistics.
    ProfStats = 8,
    /// Client advertises its reclamation weight.
    SetWeight = 9,
    /// Client advertises latency criticality.
    SetLatCritical = 10,
}

impl CtrlOpCode {
    /// Convert from the raw wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Connect,
            1 => Self::Disconnect,
            2 => Self::Alloc,
            3 => Self::Overcommit,
            4 => Self::Free,
            5 => Self::UpdLimit,
            6 => Self::UpdLimitReq,
            7 => Self::ForceReclaim,
            8 => Self::ProfStats,
            9 => Self::SetWeight,
            10 => Self::SetLatCritical,
            _ => return None,
        })
    }
}

/// Return code of a control-plane reply.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlRetCode {
    /// Connection accepted.
    ConnSucc = 0,
    /// Connection rejected.
    ConnFail = 1,
    /// Memory operation succeeded.
    MemSucc = 2,
    /// Memory operation failed (e.g. overcommit rejected).
    MemFail = 3,
}

impl CtrlRetCode {
    /// Convert from the raw wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::ConnSucc,
            1 => Self::ConnFail,
            2 => Self::MemSucc,
            3 => Self::MemFail,
            _ => return None,
        })
    }
}

/// The operation-dependent payload of a [`MemMsg`].
///
/// On the wire this is an untagged 8-byte union; the active variant is
/// implied by the message opcode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemPayload {
    /// Region or limit size in bytes (`Alloc`, `Overcommit`, `UpdLimit`,
    /// `UpdLimitReq`, `ForceReclaim`).
    Size(u64),
    /// Reclamation weight (`SetWeight`).
    Weight(f32),
    /// Latency criticality (`SetLatCritical`).
    LatCritical(bool),
    /// No payload (everything else).
    None,
}

impl MemPayload {
    fn encode(self) -> u64 {
        match self {
            Self::Size(size) => size,
            Self::Weight(weight) => weight.to_bits() as u64,
            Self::LatCritical(flag) => flag as u64,
            Self::None => 0,
        }
    }

    fn decode(op: CtrlOpCode, raw: u64) -> Self {
        match op {
            CtrlOpCode::Alloc
            | CtrlOpCode::Overcommit
            | CtrlOpCode::UpdLimit
            | CtrlOpCode::UpdLimitReq
            | CtrlOpCode::ForceReclaim => Self::Size(raw),
            CtrlOpCode::SetWeight => Self::Weight(f32::from_bits(raw as u32)),
            CtrlOpCode::SetLatCritical => Self::LatCritical(raw != 0),
            _ => Self::None,
        }
    }
}

/// Memory sub-message carried by every [`CtrlMsg`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemMsg {
    /// Region being allocated, freed, or granted. `-1` when not applicable.
    pub region_id: i64,
    /// Operation-dependent payload.
    pub payload: MemPayload,
}

impl MemMsg {
    /// A `MemMsg` with no region and no payload.
    pub fn empty() -> Self {
        Self {
            region_id: -1,
            payload: MemPayload::None,
        }
    }
}

/// A control-plane message (request or reply).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtrlMsg {
    /// Correlation id chosen by the requester and echoed in the reply.
    pub id: u64,
    /// Operation code.
    pub op: CtrlOpCode,
    /// Return code; requests carry `MemFail` as a placeholder.
    pub ret: CtrlRetCode,
    /// Memory sub-message.
    pub mmsg: MemMsg,
}

impl CtrlMsg {
    /// Build a request message.
    pub fn request(id: u64, op: CtrlOpCode, mmsg: MemMsg) -> Self {
        Self {
            id,
            op,
            ret: CtrlRetCode::MemFail,
            mmsg,
        }
    }

    /// Encode into the fixed 32-byte wire frame.
    pub fn encode(&self) -> [u8; CTRL_MSG_SIZE] {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.op as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(self.ret as u32).to_le_bytes());
        buf[16..24].copy_from_slice(&self.mmsg.region_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.mmsg.payload.encode().to_le_bytes());
        buf
    }

    /// Decode from a 32-byte wire frame.
    ///
    /// Returns `None` on an unknown opcode or return code. The payload
    /// variant is selected by the opcode.
    pub fn decode(buf: &[u8; CTRL_MSG_SIZE]) -> Option<Self> {
        let id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let op = CtrlOpCode::from_u32(u32::from_le_bytes(buf[8..12].try_into().unwrap()))?;
        let ret = CtrlRetCode::from_u32(u32::from_le_bytes(buf[12..16].try_into().unwrap()))?;
        let region_id = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let raw = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        Some(Self {
            id,
            op,
            ret,
            mmsg: MemMsg {
                region_id,
                payload: MemPayload::decode(op, raw),
            },
        })
    }
}

/// Statistics reply, sharing the 32-byte frame with [`CtrlMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsMsg {
    /// Cache hits in the reporting window.
    pub hits: u64,
    /// Cache misses in the reporting window.
    pub misses: u64,
    /// Average miss penalty in nanoseconds.
    pub miss_penalty: f64,
    /// Victim-cache hits in the reporting window.
    pub vhits: u32,
    /// Remaining region headroom before the limit is reached.
    pub headroom: u32,
}

impl StatsMsg {
    /// Encode into the fixed 32-byte wire frame.
    pub fn encode(&self) -> [u8; CTRL_MSG_SIZE] {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        buf[0..8].copy_from_slice(&self.hits.to_le_bytes());
        buf[8..16].copy_from_slice(&self.misses.to_le_bytes());
        buf[16..24].copy_from_slice(&self.miss_penalty.to_le_bytes());
        buf[24..28].copy_from_slice(&self.vhits.to_le_bytes());
        buf[28..32].copy_from_slice(&self.headroom.to_le_bytes());
        buf
    }

    /// Decode from a 32-byte wire frame.
    pub fn decode(buf: &[u8; CTRL_MSG_SIZE]) -> Self {
        Self {
            hits: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            misses: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            miss_penalty: f64::from_le_bytes(buf[16..24].try_into().unwrap()),
            vhits: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            headroom: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        }
    }
}

/// Shared-region name for a given process and region id, e.g. `region-42-7`.
pub fn region_name(pid: u32, rid: i64) -> String {
    format!("region-{pid}-{rid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for raw in 0..=10 {
            let op = CtrlOpCode::from_u32(raw).unwrap();
            assert_eq!(op as u32, raw);
        }
        assert!(CtrlOpCode::from_u32(11).is_none());
        assert!(CtrlRetCode::from_u32(4).is_none());
    }

    #[test]
    fn test_ctrl_msg_roundtrip() {
        let msg = CtrlMsg {
            id: 0xfeed_beef,
            op: CtrlOpCode::Alloc,
            ret: CtrlRetCode::MemSucc,
            mmsg: MemMsg {
                region_id: 17,
                payload: MemPayload::Size(16 << 20),
            },
        };
        let decoded = CtrlMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_payload_selected_by_opcode() {
        let msg = CtrlMsg::request(
            1,
            CtrlOpCode::SetWeight,
            MemMsg {
                region_id: -1,
                payload: MemPayload::Weight(2.5),
            },
        );
        let decoded = CtrlMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mmsg.payload, MemPayload::Weight(2.5));

        let msg = CtrlMsg::request(
            2,
            CtrlOpCode::SetLatCritical,
            MemMsg {
                region_id: -1,
                payload: MemPayload::LatCritical(true),
            },
        );
        let decoded = CtrlMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mmsg.payload, MemPayload::LatCritical(true));

        // Connect carries no payload regardless of the raw bytes.
        let msg = CtrlMsg::request(
            3,
            CtrlOpCode::Connect,
            MemMsg {
                region_id: -1,
                payload: MemPayload::Size(99),
            },
        );
        let decoded = CtrlMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mmsg.payload, MemPayload::None);
    }

    #[test]
    fn test_stats_msg_roundtrip() {
        let stats = StatsMsg {
            hits: 1000,
            misses: 25,
            miss_penalty: 1250.5,
            vhits: 7,
            headroom: 3,
        };
        let decoded = StatsMsg::decode(&stats.encode());
        assert_eq!(decoded, stats);
    }

    #[test]
    fn test_frames_share_size() {
        let ctrl = CtrlMsg::request(0, CtrlOpCode::Connect, MemMsg::empty());
        let stats = StatsMsg::default();
        assert_eq!(ctrl.encode().len(), stats.encode().len());
        assert_eq!(ctrl.encode().len(), CTRL_MSG_SIZE);
    }

    #[test]
    fn test_region_name() {
        assert_eq!(region_name(1234, 7), "region-1234-7");
    }
}

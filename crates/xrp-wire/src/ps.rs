// Author: Lukas Bower
// Purpose: Common-namespace command messages understood by the DSP service layer.

//! Messages of the common command namespace. Every message starts with a
//! `u32` command word followed by a command-specific body.

use crate::{read_u32, read_u64, take, WireError, NAMESPACE_ID_SIZE};

/// Namespace id routing a request to the common command handler.
pub const NSID_COMMON_CMD: [u8; NAMESPACE_ID_SIZE] = [
    0xf9, 0x3c, 0x09, 0x61, 0x9d, 0x3f, 0x45, 0x29, 0xbd, 0xe9, 0x7a, 0x4b, 0x18, 0x91, 0xdb, 0x15,
];

/// Commands of the common namespace implemented by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PsCommand {
    /// Echo the body back.
    LoopbackTest = 3,
    /// Register or release a report id with the firmware.
    ReportConfig = 4,
    /// Change the firmware log level.
    LogConfig = 5,
    /// Liveness probe.
    HeartBeatReq = 6,
    /// Copy a block between two DSP addresses.
    DataMove = 13,
}

impl TryFrom<u32> for PsCommand {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            3 => Self::LoopbackTest,
            4 => Self::ReportConfig,
            5 => Self::LogConfig,
            6 => Self::HeartBeatReq,
            13 => Self::DataMove,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// Prefix `body` with the command word.
#[must_use]
pub fn encode(command: PsCommand, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(command as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a message into its command and body.
pub fn decode(bytes: &[u8]) -> Result<(PsCommand, &[u8]), WireError> {
    let command = PsCommand::try_from(read_u32(bytes, 0)?)?;
    Ok((command, &bytes[4..]))
}

/// Body of [`PsCommand::DataMove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMoveMsg {
    /// DSP source address.
    pub src_addr: u64,
    /// DSP destination address.
    pub dst_addr: u64,
    /// Bytes to copy.
    pub size: u32,
}

impl DataMoveMsg {
    /// Encoded size.
    pub const SIZE: usize = 20;

    /// Encode into the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.src_addr.to_le_bytes());
        out.extend_from_slice(&self.dst_addr.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decode from the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = take(bytes, 0, Self::SIZE)?;
        Ok(Self {
            src_addr: read_u64(raw, 0)?,
            dst_addr: read_u64(raw, 8)?,
            size: read_u32(raw, 16)?,
        })
    }
}

/// Setup or teardown marker of [`ReportConfigMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReportAction {
    /// Start posting reports for the id.
    Setup = 0,
    /// Stop posting reports for the id.
    Release = 1,
}

/// Body of [`PsCommand::ReportConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportConfigMsg {
    /// Setup or release.
    pub action: ReportAction,
    /// Report id.
    pub report_id: u32,
    /// Payload size the firmware should post.
    pub size: u32,
}

impl ReportConfigMsg {
    /// Encoded size.
    pub const SIZE: usize = 12;

    /// Encode into the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        [self.action as u32, self.report_id, self.size]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    /// Decode from the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let action = match read_u32(bytes, 0)? {
            0 => ReportAction::Setup,
            1 => ReportAction::Release,
            value => {
                return Err(WireError::InvalidValue {
                    field: "report_action",
                    value,
                })
            }
        };
        Ok(Self {
            action,
            report_id: read_u32(bytes, 4)?,
            size: read_u32(bytes, 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_move_fits_out_of_line_but_not_inline() {
        let msg = encode(
            PsCommand::DataMove,
            &DataMoveMsg {
                src_addr: 0x1000,
                dst_addr: 0x2000,
                size: 64,
            }
            .encode(),
        );
        assert!(msg.len() > crate::INLINE_DATA_SIZE);
        let (command, body) = decode(&msg).unwrap();
        assert_eq!(command, PsCommand::DataMove);
        assert_eq!(DataMoveMsg::decode(body).unwrap().dst_addr, 0x2000);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(
            decode(&99u32.to_le_bytes()).unwrap_err(),
            WireError::UnknownCommand(99)
        );
    }
}

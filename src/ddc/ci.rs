use std::time::Duration;

use nom::number::complete::le_u8;
use nom::{IResult, Parser};
use thiserror::Error;

use super::{framing::ReplyFraming, transport::TransactionRequest};

#[derive(Debug, Error)]
pub enum DdcCiProtocolError {
    #[error("invalid packet lengh: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("reply sent from unexpected address {0:#04x}")]
    UnexpectedSource(u8),
    #[error("reply carries unexpected opcode {0:#04x}")]
    UnexpectedOpcode(u8),
    #[error("reply is for vcp feature {actual:#04x}, requested {requested:#04x}")]
    FeatureMismatch { requested: u8, actual: u8 },
    #[error("checksum invalid")]
    InvalidChecksum,
    #[error("Error parsing DDC CI Message: {0}")]
    ParserError(String),
}

/// display address the host writes to
pub const DDC_DISPLAY_WRITE_ADDR: u8 = 0x6e;
/// display address the host reads replies from
pub const DDC_DISPLAY_READ_ADDR: u8 = 0x6f;
/// host source address, sent as sub-address of every DDC/CI request
pub const DDC_HOST_SUB_ADDR: u8 = 0x51;

const LENGTH_PREFIX: u8 = 0x80;

pub const VCP_REPLY_LENGTH: usize = 11;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DdcOpcode {
    VcpRequest,
    VcpReply,
    SetVcp,
    Unknown(u8),
}

impl From<&DdcOpcode> for u8 {
    fn from(value: &DdcOpcode) -> Self {
        match value {
            DdcOpcode::Unknown(value) => *value,
            DdcOpcode::VcpRequest => 0x01,
            DdcOpcode::VcpReply => 0x02,
            DdcOpcode::SetVcp => 0x03,
        }
    }
}

impl From<u8> for DdcOpcode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::VcpRequest,
            0x02 => Self::VcpReply,
            0x03 => Self::SetVcp,
            _ => Self::Unknown(value),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ResultCode {
    NoError,
    UnsupportedCode,
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::UnsupportedCode,
            _ => Self::Unknown(value),
        }
    }
}

/// XOR checksum over everything that precedes it on the wire
pub fn xor_checksum<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> u8 {
    bytes.into_iter().fold(0, |checksum, byte| checksum ^ byte)
}

/// length prefix, opcode, body and trailing checksum of a host to display message
fn frame(opcode: DdcOpcode, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + 3);
    // the length covers opcode and body, not the length byte itself
    data.push(LENGTH_PREFIX | (body.len() as u8 + 1));
    data.push((&opcode).into());
    data.extend_from_slice(body);
    let checksum = DDC_DISPLAY_WRITE_ADDR ^ DDC_HOST_SUB_ADDR ^ xor_checksum(&data);
    data.push(checksum);
    data
}

/// A new value for a VCP control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpWriteCommand {
    pub control_id: u8,
    pub new_value: u16,
}

impl VcpWriteCommand {
    pub fn new(control_id: u8, new_value: u16) -> Self {
        Self {
            control_id,
            new_value,
        }
    }

    pub fn transmit_buffer(&self) -> Vec<u8> {
        let [value_high, value_low] = self.new_value.to_be_bytes();
        frame(DdcOpcode::SetVcp, &[self.control_id, value_high, value_low])
    }

    /// set vcp is fire and forget, the display sends no reply
    pub fn request(&self) -> TransactionRequest {
        TransactionRequest {
            send_address: DDC_DISPLAY_WRITE_ADDR,
            send_sub_address: Some(DDC_HOST_SUB_ADDR),
            send: self.transmit_buffer(),
            reply_address: DDC_DISPLAY_READ_ADDR,
            reply_sub_address: None,
            reply_len: 0,
            min_reply_delay: Duration::ZERO,
            reply_framing: ReplyFraming::None,
        }
    }
}

/// A request for the current and maximum value of a VCP control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpReadCommand {
    pub control_id: u8,
}

impl VcpReadCommand {
    pub fn new(control_id: u8) -> Self {
        Self { control_id }
    }

    pub fn transmit_buffer(&self) -> Vec<u8> {
        frame(DdcOpcode::VcpRequest, &[self.control_id])
    }

    /// reply framing and delay are filled in once the bus has been negotiated
    pub fn request(&self) -> TransactionRequest {
        TransactionRequest {
            send_address: DDC_DISPLAY_WRITE_ADDR,
            send_sub_address: Some(DDC_HOST_SUB_ADDR),
            send: self.transmit_buffer(),
            reply_address: DDC_DISPLAY_READ_ADDR,
            reply_sub_address: Some(DDC_HOST_SUB_ADDR),
            reply_len: VCP_REPLY_LENGTH,
            min_reply_delay: Duration::ZERO,
            reply_framing: ReplyFraming::DdcCi,
        }
    }

    /// validate a raw reply against this request and extract its values
    pub fn parse_reply(&self, reply: &[u8]) -> Result<VcpFeatureReply, DdcCiProtocolError> {
        if reply.len() != VCP_REPLY_LENGTH {
            return Err(DdcCiProtocolError::InvalidLength {
                expected: VCP_REPLY_LENGTH,
                actual: reply.len(),
            });
        }
        let (_, raw) = parse_vcp_reply(reply)?;
        if raw.source != DDC_DISPLAY_WRITE_ADDR {
            return Err(DdcCiProtocolError::UnexpectedSource(raw.source));
        }
        if raw.opcode != DdcOpcode::VcpReply {
            return Err(DdcCiProtocolError::UnexpectedOpcode((&raw.opcode).into()));
        }
        if raw.vcp_feature != self.control_id {
            return Err(DdcCiProtocolError::FeatureMismatch {
                requested: self.control_id,
                actual: raw.vcp_feature,
            });
        }
        let expected =
            DDC_DISPLAY_READ_ADDR ^ DDC_HOST_SUB_ADDR ^ xor_checksum(&reply[1..VCP_REPLY_LENGTH - 1]);
        if raw.checksum != expected {
            return Err(DdcCiProtocolError::InvalidChecksum);
        }
        Ok(VcpFeatureReply {
            result_code: raw.result_code,
            vcp_feature: raw.vcp_feature,
            type_code: raw.type_code,
            // values are single byte, the high bytes are ignored
            max_value: raw.max_low,
            current_value: raw.current_low,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpFeatureReply {
    result_code: u8,
    vcp_feature: u8,
    type_code: u8,
    max_value: u8,
    current_value: u8,
}

impl VcpFeatureReply {
    pub fn result_code(&self) -> ResultCode {
        self.result_code.into()
    }

    pub fn vcp_feature(&self) -> u8 {
        self.vcp_feature
    }

    pub fn type_code(&self) -> u8 {
        self.type_code
    }

    pub fn max_value(&self) -> u8 {
        self.max_value
    }

    pub fn current_value(&self) -> u8 {
        self.current_value
    }
}

struct RawVcpReply {
    source: u8,
    opcode: DdcOpcode,
    result_code: u8,
    vcp_feature: u8,
    type_code: u8,
    max_low: u8,
    current_low: u8,
    checksum: u8,
}

fn parse_vcp_reply(i: &[u8]) -> IResult<&[u8], RawVcpReply> {
    let (i, source) = le_u8.parse(i)?;
    let (i, _length) = le_u8.parse(i)?;
    let (i, opcode) = le_u8.parse(i)?;
    let (i, result_code) = le_u8.parse(i)?;
    let (i, vcp_feature) = le_u8.parse(i)?;
    let (i, type_code) = le_u8.parse(i)?;
    let (i, _max_high) = le_u8.parse(i)?;
    let (i, max_low) = le_u8.parse(i)?;
    let (i, _current_high) = le_u8.parse(i)?;
    let (i, current_low) = le_u8.parse(i)?;
    let (i, checksum) = le_u8.parse(i)?;
    Ok((
        i,
        RawVcpReply {
            source,
            opcode: opcode.into(),
            result_code,
            vcp_feature,
            type_code,
            max_low,
            current_low,
            checksum,
        },
    ))
}

impl<T> From<nom::Err<T>> for DdcCiProtocolError
where
    T: core::fmt::Debug,
{
    fn from(value: nom::Err<T>) -> Self {
        DdcCiProtocolError::ParserError(format!("{value:?}"))
    }
}

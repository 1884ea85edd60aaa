use std::time::Duration;

use nom::bytes::complete::tag;
use nom::number::complete::{be_u16, le_u16, le_u32, le_u8};
use nom::{IResult, Parser};
use thiserror::Error;

use super::{framing::ReplyFraming, resolver::DisplayIdentity, transport::TransactionRequest};

/// E-DDC address the host writes the EDID offset to
pub const EDID_WRITE_ADDR: u8 = 0xa0;
/// E-DDC address the EDID block is read from
pub const EDID_READ_ADDR: u8 = 0xa1;

pub const EDID_BLOCK_LENGTH: usize = 128;

#[derive(Error, Debug)]
pub enum EdidParseError {
    #[error("Checksum is invalid, data corrupt!")]
    InvalidChecksum,
    #[error("EDID block must be 128 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Parsing data failed: {0}")]
    NomParserError(String),
}

impl<T> From<nom::Err<T>> for EdidParseError
where
    T: core::fmt::Debug,
{
    fn from(value: nom::Err<T>) -> Self {
        EdidParseError::NomParserError(format!("{value:?}"))
    }
}

/// the EDID checksum is an arithmetic sum, unlike the DDC/CI xor checksums
pub fn checksum_valid(block: &[u8]) -> bool {
    block.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte)) == 0
}

/// read the base block starting at offset 0
pub fn edid_request() -> TransactionRequest {
    TransactionRequest {
        send_address: EDID_WRITE_ADDR,
        send_sub_address: None,
        send: vec![0x00],
        reply_address: EDID_READ_ADDR,
        reply_sub_address: None,
        reply_len: EDID_BLOCK_LENGTH,
        min_reply_delay: Duration::ZERO,
        reply_framing: ReplyFraming::Simple,
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Header {
    pub vendor: [char; 3],
    /// packed manufacturer id as stored in the block
    pub vendor_id: u16,
    pub product: u16,
    pub serial: u32,
    pub week: u8,
    pub year: u8, // Starting at year 1990
    pub version: u8,
    pub revision: u8,
}

impl Header {
    pub fn identity(&self) -> DisplayIdentity {
        DisplayIdentity {
            vendor_id: self.vendor_id.into(),
            product_id: self.product.into(),
            serial_number: self.serial,
        }
    }
}

fn parse_vendor(v: u16) -> [char; 3] {
    let mask: u8 = 0x1F; // Each letter is 5 bits
    let i0 = b'A' - 1; // 0x01 = A
    [
        (((v >> 10) as u8 & mask) + i0) as char,
        (((v >> 5) as u8 & mask) + i0) as char,
        ((v as u8 & mask) + i0) as char,
    ]
}

fn parse_header(i: &[u8]) -> IResult<&[u8], Header> {
    let (i, _) = tag(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00][..]).parse(i)?;
    let (i, vendor_id) = be_u16.parse(i)?;
    let (i, product) = le_u16.parse(i)?;
    let (i, serial) = le_u32.parse(i)?;
    let (i, week) = le_u8.parse(i)?;
    let (i, year) = le_u8.parse(i)?;
    let (i, version) = le_u8.parse(i)?;
    let (i, revision) = le_u8.parse(i)?;
    Ok((
        i,
        Header {
            vendor: parse_vendor(vendor_id),
            vendor_id,
            product,
            serial,
            week,
            year,
            version,
            revision,
        },
    ))
}

/// A checksum verified 128 byte EDID base block.
#[derive(Clone, PartialEq, Eq)]
pub struct EdidBlock([u8; EDID_BLOCK_LENGTH]);

impl EdidBlock {
    pub fn from_bytes(data: &[u8]) -> Result<Self, EdidParseError> {
        let block: [u8; EDID_BLOCK_LENGTH] = data
            .try_into()
            .map_err(|_| EdidParseError::InvalidLength(data.len()))?;
        if checksum_valid(&block) {
            Ok(Self(block))
        } else {
            Err(EdidParseError::InvalidChecksum)
        }
    }

    pub fn as_bytes(&self) -> &[u8; EDID_BLOCK_LENGTH] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; EDID_BLOCK_LENGTH] {
        self.0
    }

    pub fn header(&self) -> Result<Header, EdidParseError> {
        let (_, header) = parse_header(&self.0)?;
        Ok(header)
    }
}

impl std::fmt::Debug for EdidBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EdidBlock").field(&self.header().ok()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use proptest::prelude::*;

    use crate::ddc::ci::DdcCiProtocolError;

    use super::{checksum_valid, EdidBlock, EdidParseError, EDID_BLOCK_LENGTH};

    /// base block for a "DEL" monitor with fixed up checksum
    pub(crate) fn sample_block() -> [u8; EDID_BLOCK_LENGTH] {
        let mut block = [0u8; EDID_BLOCK_LENGTH];
        block[..8].copy_from_slice(&[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
        // "DEL" packed into 5 bit letters
        block[8] = 0x10;
        block[9] = 0xac;
        block[10] = 0xc4;
        block[11] = 0xa0;
        block[12..16].copy_from_slice(&0x4c4b_3032u32.to_le_bytes());
        block[16] = 12;
        block[17] = 30;
        block[18] = 1;
        block[19] = 4;
        let sum = block[..127].iter().fold(0u8, |s, b| s.wrapping_add(*b));
        block[127] = 0u8.wrapping_sub(sum);
        block
    }

    #[test]
    fn accepts_zero_sum_block() {
        let block = sample_block();
        assert!(checksum_valid(&block));
        let edid = EdidBlock::from_bytes(&block).unwrap();
        assert_eq!(edid.as_bytes(), &block);
    }

    #[test]
    fn rejects_short_block() {
        assert!(matches!(
            EdidBlock::from_bytes(&[0u8; 64]),
            Err(EdidParseError::InvalidLength(64))
        ));
    }

    #[test]
    fn xor_is_not_the_edid_checksum() {
        // 0x01 ^ 0x01 == 0 but 0x01 + 0x01 != 0
        let mut block = [0u8; EDID_BLOCK_LENGTH];
        block[0] = 0x01;
        block[1] = 0x01;
        assert!(!checksum_valid(&block));
    }

    #[test]
    fn parses_header_identity() {
        let edid = EdidBlock::from_bytes(&sample_block()).unwrap();
        let header = edid.header().unwrap();
        assert_eq!(header.vendor, ['D', 'E', 'L']);
        assert_eq!(header.product, 0xa0c4);
        assert_eq!(header.serial, 0x4c4b_3032);
        let identity = header.identity();
        assert_eq!(identity.vendor_id, 0x10ac);
        assert_eq!(identity.product_id, 0xa0c4);
    }

    #[test]
    fn parser_errors_read_like_ddc_ci_ones() {
        let edid = EdidParseError::from(nom::Err::<()>::Incomplete(nom::Needed::Unknown));
        let ci = DdcCiProtocolError::from(nom::Err::<()>::Incomplete(nom::Needed::Unknown));
        match (edid, ci) {
            (EdidParseError::NomParserError(edid), DdcCiProtocolError::ParserError(ci)) => {
                assert_eq!(edid, ci)
            }
            other => panic!("unexpected errors {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn rejects_any_sum_changing_mutation(position in 0..EDID_BLOCK_LENGTH, delta in 1..=u8::MAX) {
            let mut corrupt = sample_block();
            corrupt[position] = corrupt[position].wrapping_add(delta);
            prop_assert!(!checksum_valid(&corrupt));
            prop_assert!(matches!(
                EdidBlock::from_bytes(&corrupt),
                Err(EdidParseError::InvalidChecksum)
            ));
        }
    }
}

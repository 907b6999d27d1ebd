//! Decoded chain structures supplied by the consensus layer.
//!
//! Inputs arrive with their previous output already resolved: the sender's
//! address hash and the spent output's business attachment are carried on
//! the input itself.

use crate::constants::{HASH_SIZE, POINT_SIZE, SHORT_HASH_SIZE};
use crate::error::{Error, Result};
use crate::serial::{Reader, Writer};

/// Transaction or block hash
pub type HashDigest = [u8; HASH_SIZE];
/// Address hash
pub type ShortHash = [u8; SHORT_HASH_SIZE];

pub const NULL_HASH: HashDigest = [0u8; HASH_SIZE];

/// Serialized header width
pub const HEADER_SIZE: usize = 4 + HASH_SIZE + HASH_SIZE + 4 + 4 + 8 + 8;

/// Hash used for headers, transactions and asset symbols
pub fn digest(bytes: &[u8]) -> HashDigest {
    *blake3::hash(bytes).as_bytes()
}

/// Reference to one output of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub hash: HashDigest,
    pub index: u32,
}

impl Point {
    pub fn new(hash: HashDigest, index: u32) -> Self {
        Point { hash, index }
    }

    /// Previous output of a coinbase input
    pub fn null() -> Self {
        Point {
            hash: NULL_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == NULL_HASH
    }

    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        let mut bytes = [0u8; POINT_SIZE];
        bytes[..HASH_SIZE].copy_from_slice(&self.hash);
        bytes[HASH_SIZE..].copy_from_slice(&self.index.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_reader(&mut Reader::new(bytes))
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Point {
            hash: reader.read_array()?,
            index: reader.read_u32()?,
        })
    }

    /// Compact identifier stored in spend rows: the leading eight hash
    /// bytes with the low 15 bits replaced by the output index.
    pub fn checksum(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.hash[..8]);
        let hash = u64::from_le_bytes(head);
        (hash & !0x7fff) | u64::from(self.index & 0x7fff)
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub previous_block_hash: HashDigest,
    pub merkle: HashDigest,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u64,
    pub number: u64,
}

impl Header {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(HEADER_SIZE);
        writer.write_u32(self.version);
        writer.write_bytes(&self.previous_block_hash);
        writer.write_bytes(&self.merkle);
        writer.write_u32(self.timestamp);
        writer.write_u32(self.bits);
        writer.write_u64(self.nonce);
        writer.write_u64(self.number);
        writer.into_inner()
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Header {
            version: reader.read_u32()?,
            previous_block_hash: reader.read_array()?,
            merkle: reader.read_array()?,
            timestamp: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u64()?,
            number: reader.read_u64()?,
        })
    }

    pub fn hash(&self) -> HashDigest {
        digest(&self.to_bytes())
    }
}

/// Stealth payment metadata carried by the output preceding the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthMetadata {
    pub prefix: u32,
    pub ephemeral_key_hash: HashDigest,
}

/// Asset definition created by an issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDetail {
    pub symbol: String,
    pub maximum_supply: u64,
    pub decimal_number: u8,
    pub issuer: String,
    pub description: String,
}

impl AssetDetail {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.symbol);
        writer.write_u64(self.maximum_supply);
        writer.write_u8(self.decimal_number);
        writer.write_string(&self.issuer);
        writer.write_string(&self.description);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_inner()
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(AssetDetail {
            symbol: reader.read_string()?,
            maximum_supply: reader.read_u64()?,
            decimal_number: reader.read_u8()?,
            issuer: reader.read_string()?,
            description: reader.read_string()?,
        })
    }
}

/// Movement of an existing asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTransfer {
    pub symbol: String,
    pub quantity: u64,
}

/// Digital identity registered on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidDetail {
    pub symbol: String,
    pub issuer: String,
    /// Address currently bound to the identity
    pub address: String,
    pub description: String,
}

impl DidDetail {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.symbol);
        writer.write_string(&self.issuer);
        writer.write_string(&self.address);
        writer.write_string(&self.description);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_inner()
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(DidDetail {
            symbol: reader.read_string()?,
            issuer: reader.read_string()?,
            address: reader.read_string()?,
            description: reader.read_string()?,
        })
    }
}

/// Rebinding of an identity to a new address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidTransfer {
    pub symbol: String,
    pub address: String,
}

/// Asset certificate: a right over `symbol` held by `owner`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCert {
    pub symbol: String,
    pub owner: String,
    /// Certificate type bits
    pub certs: u64,
}

impl AssetCert {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.symbol);
        writer.write_string(&self.owner);
        writer.write_u64(self.certs);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_inner()
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(AssetCert {
            symbol: reader.read_string()?,
            owner: reader.read_string()?,
            certs: reader.read_u64()?,
        })
    }
}

/// Business payload attached to an output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Etp,
    AssetIssue(AssetDetail),
    AssetTransfer(AssetTransfer),
    Message(String),
    /// Mining reward locked until `height`
    EtpAward { height: u64 },
    DidRegister(DidDetail),
    DidTransfer(DidTransfer),
    AssetCert(AssetCert),
}

impl Attachment {
    /// Persisted discriminant of the attachment
    pub fn kind(&self) -> u16 {
        match self {
            Attachment::Etp => 0,
            Attachment::AssetIssue(_) => 1,
            Attachment::AssetTransfer(_) => 2,
            Attachment::Message(_) => 3,
            Attachment::EtpAward { .. } => 4,
            Attachment::DidRegister(_) => 5,
            Attachment::DidTransfer(_) => 6,
            Attachment::AssetCert(_) => 7,
        }
    }

    /// Kind-specific body, without the discriminant
    pub fn body(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            Attachment::Etp => {}
            Attachment::AssetIssue(detail) => detail.write(&mut writer),
            Attachment::AssetTransfer(transfer) => {
                writer.write_string(&transfer.symbol);
                writer.write_u64(transfer.quantity);
            }
            Attachment::Message(content) => writer.write_string(content),
            Attachment::EtpAward { height } => writer.write_u64(*height),
            Attachment::DidRegister(detail) => detail.write(&mut writer),
            Attachment::DidTransfer(transfer) => {
                writer.write_string(&transfer.symbol);
                writer.write_string(&transfer.address);
            }
            Attachment::AssetCert(cert) => cert.write(&mut writer),
        }
        writer.into_inner()
    }

    pub fn from_body(kind: u16, body: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(body);
        match kind {
            0 => Ok(Attachment::Etp),
            1 => Ok(Attachment::AssetIssue(AssetDetail::from_reader(&mut reader)?)),
            2 => Ok(Attachment::AssetTransfer(AssetTransfer {
                symbol: reader.read_string()?,
                quantity: reader.read_u64()?,
            })),
            3 => Ok(Attachment::Message(reader.read_string()?)),
            4 => Ok(Attachment::EtpAward {
                height: reader.read_u64()?,
            }),
            5 => Ok(Attachment::DidRegister(DidDetail::from_reader(&mut reader)?)),
            6 => Ok(Attachment::DidTransfer(DidTransfer {
                symbol: reader.read_string()?,
                address: reader.read_string()?,
            })),
            7 => Ok(Attachment::AssetCert(AssetCert::from_reader(&mut reader)?)),
            other => Err(Error::Corrupted(format!("unknown attachment kind {}", other))),
        }
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.kind());
        writer.write_var_bytes(&self.body());
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let kind = reader.read_u16()?;
        let body = reader.read_var_bytes()?;
        Self::from_body(kind, body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub previous_output: Point,
    pub script: Vec<u8>,
    pub sequence: u32,
    /// Address of the spent output, resolved by the caller
    pub address: Option<ShortHash>,
    /// Attachment of the spent output, resolved by the caller
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub value: u64,
    pub script: Vec<u8>,
    /// Receiving address, if the script pays one
    pub address: Option<ShortHash>,
    pub stealth: Option<StealthMetadata>,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub locktime: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn hash(&self) -> HashDigest {
        digest(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.write_u32(self.version);

        writer.write_variable(self.inputs.len() as u64);
        for input in &self.inputs {
            writer.write_bytes(&input.previous_output.to_bytes());
            writer.write_var_bytes(&input.script);
            writer.write_u32(input.sequence);
            write_optional(&mut writer, input.address.as_ref(), |w, a| w.write_bytes(a));
            write_optional(&mut writer, input.attachment.as_ref(), |w, a| a.write(w));
        }

        writer.write_variable(self.outputs.len() as u64);
        for output in &self.outputs {
            writer.write_u64(output.value);
            writer.write_var_bytes(&output.script);
            write_optional(&mut writer, output.address.as_ref(), |w, a| w.write_bytes(a));
            write_optional(&mut writer, output.stealth.as_ref(), |w, s| {
                w.write_u32(s.prefix);
                w.write_bytes(&s.ephemeral_key_hash);
            });
            write_optional(&mut writer, output.attachment.as_ref(), |w, a| a.write(w));
        }

        writer.write_u32(self.locktime);
        writer.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_reader(&mut Reader::new(bytes))
    }

    pub fn from_reader(reader: &mut Reader<'_>) -> Result<Self> {
        let version = reader.read_u32()?;

        let input_count = reader.read_variable()?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            inputs.push(Input {
                previous_output: Point::from_reader(reader)?,
                script: reader.read_var_bytes()?.to_vec(),
                sequence: reader.read_u32()?,
                address: read_optional(reader, |r| r.read_array())?,
                attachment: read_optional(reader, Attachment::read)?,
            });
        }

        let output_count = reader.read_variable()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            outputs.push(Output {
                value: reader.read_u64()?,
                script: reader.read_var_bytes()?.to_vec(),
                address: read_optional(reader, |r| r.read_array())?,
                stealth: read_optional(reader, |r| {
                    Ok(StealthMetadata {
                        prefix: r.read_u32()?,
                        ephemeral_key_hash: r.read_array()?,
                    })
                })?,
                attachment: read_optional(reader, Attachment::read)?,
            });
        }

        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> HashDigest {
        self.header.hash()
    }
}

fn write_optional<T, F>(writer: &mut Writer, value: Option<&T>, write: F)
where
    F: FnOnce(&mut Writer, &T),
{
    match value {
        Some(value) => {
            writer.write_u8(1);
            write(writer, value);
        }
        None => writer.write_u8(0),
    }
}

fn read_optional<'a, T, F>(reader: &mut Reader<'a>, read: F) -> Result<Option<T>>
where
    F: FnOnce(&mut Reader<'a>) -> Result<T>,
{
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(read(reader)?)),
        flag => Err(Error::Corrupted(format!("invalid option flag {}", flag))),
    }
}

use crate::error::{Error, Result};

/// Little-endian byte writer for stored values
#[derive(Debug, Default)]
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Compact length prefix: 1, 3, 5 or 9 bytes.
    pub fn write_variable(&mut self, value: u64) {
        if value < 0xfd {
            self.write_u8(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.write_u8(0xfd);
            self.write_u16(value as u16);
        } else if value <= u64::from(u32::MAX) {
            self.write_u8(0xfe);
            self.write_u32(value as u32);
        } else {
            self.write_u8(0xff);
            self.write_u64(value);
        }
    }

    /// Length-prefixed byte string
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_variable(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Little-endian byte reader over a stored value
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, position: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(len).ok_or(Error::Overflow)?;
        if end > self.data.len() {
            return Err(Error::Corrupted(format!(
                "value truncated: need {} bytes at {}, have {}",
                len,
                self.position,
                self.data.len()
            )));
        }
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_variable(&mut self) -> Result<u64> {
        match self.read_u8()? {
            0xfd => Ok(u64::from(self.read_u16()?)),
            0xfe => Ok(u64::from(self.read_u32()?)),
            0xff => self.read_u64(),
            small => Ok(u64::from(small)),
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_variable()?;
        let len = usize::try_from(len).map_err(|_| Error::Overflow)?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Corrupted(format!("invalid utf-8 string: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_widths() {
        for (value, width) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0x1_0000, 5), (u64::MAX, 9)] {
            let mut writer = Writer::new();
            writer.write_variable(value);
            assert_eq!(writer.len(), width);

            let bytes = writer.into_inner();
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_variable().unwrap(), value);
        }
    }

    #[test]
    fn test_mixed_fields() {
        let mut writer = Writer::new();
        writer.write_u32(7);
        writer.write_string("ETP");
        writer.write_u64(5000);
        let bytes = writer.into_inner();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "ETP");
        assert_eq!(reader.read_u64().unwrap(), 5000);
        assert_eq!(reader.position(), bytes.len());
    }

    #[test]
    fn test_truncated_value() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(matches!(reader.read_u32(), Err(Error::Corrupted(_))));
    }
}

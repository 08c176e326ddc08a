use super::BencodeValue;
use crate::error::{PeerwireError, Result};
use std::collections::BTreeMap;

/// Decode bencoded data into a BencodeValue
pub fn decode(input: &[u8]) -> Result<BencodeValue> {
    Parser { input, pos: 0 }.value()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| PeerwireError::BencodeError("Unexpected end of input".to_string()))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(PeerwireError::BencodeError(format!(
                "Expected '{}' at offset {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => self.byte_string().map(BencodeValue::Bytes),
            c => Err(PeerwireError::BencodeError(format!(
                "Invalid bencode token: {}",
                c as char
            ))),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.expect(b'i')?;
        let digits = self.take_until(b'e')?;
        let num = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| PeerwireError::BencodeError("Invalid integer".to_string()))?;
        self.expect(b'e')?;
        Ok(BencodeValue::Int(num))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let digits = self.take_until(b':')?;
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| PeerwireError::BencodeError("Invalid string length".to_string()))?;
        self.expect(b':')?;

        if self.pos + len > self.input.len() {
            return Err(PeerwireError::BencodeError(
                "String length exceeds data".to_string(),
            ));
        }

        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<BencodeValue> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.expect(b'e')?;
        Ok(BencodeValue::List(items))
    }

    fn dict(&mut self) -> Result<BencodeValue> {
        self.expect(b'd')?;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.byte_string()?;
            let value = self.value()?;
            entries.insert(key, value);
        }
        self.expect(b'e')?;
        Ok(BencodeValue::Dict(entries))
    }

    fn take_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.peek()? != delim {
            self.pos += 1;
        }
        Ok(&self.input[start..self.pos])
    }
}

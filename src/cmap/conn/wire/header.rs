use crate::error::{ErrorKind, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    pub(crate) fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend(self.length.to_le_bytes());
        buffer.extend(self.request_id.to_le_bytes());
        buffer.extend(self.response_to.to_le_bytes());
        buffer.extend((self.op_code as i32).to_le_bytes());
    }

    pub(crate) fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "Header requires {} bytes but only got {}",
                    Self::LENGTH,
                    data.len()
                ),
            }
            .into());
        }

        let mut ints = data
            .chunks_exact(std::mem::size_of::<i32>())
            .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()));

        let length = ints.next().unwrap();
        let request_id = ints.next().unwrap();
        let response_to = ints.next().unwrap();
        let op_code = OpCode::from_i32(ints.next().unwrap())?;

        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, OpCode};

    #[test]
    fn round_trip() {
        let header = Header {
            length: 261,
            request_id: 1912,
            response_to: -3,
            op_code: OpCode::Message,
        };

        let mut buffer = Vec::new();
        header.write_to(&mut buffer);
        assert_eq!(buffer.len(), Header::LENGTH);
        assert_eq!(Header::from_slice(&buffer).unwrap(), header);
    }

    #[test]
    fn little_endian_layout() {
        let header = Header {
            length: 16,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut buffer = Vec::new();
        header.write_to(&mut buffer);
        assert_eq!(
            buffer,
            vec![16, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0xD4, 0x07, 0, 0]
        );
    }

    #[test]
    fn rejects_unknown_op_code() {
        let mut buffer = Vec::new();
        Header {
            length: 16,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Reply,
        }
        .write_to(&mut buffer);
        buffer[12] = 0x2A;
        assert!(Header::from_slice(&buffer).is_err());
    }
}

use std::io::Read;

use bitflags::bitflags;
use bson::Document;

use super::header::{Header, OpCode};
use crate::{
    cmap::conn::command::Command,
    error::{ErrorKind, Result},
};

/// Represents a wire protocol operation: either an OP_MSG, a legacy OP_QUERY used for the
/// handshake against servers that predate OP_MSG, or a decoded legacy OP_REPLY.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
}

impl Message {
    /// Creates an OP_MSG message from a `Command`.
    pub(crate) fn from_command(command: Command, request_id: i32) -> Self {
        let mut body = command.body;
        body.insert("$db", command.target_db);

        let mut sections = vec![MessageSection::Document(body)];
        for sequence in command.document_sequences {
            sections.push(MessageSection::Sequence {
                identifier: sequence.identifier,
                documents: sequence.documents,
            });
        }

        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections,
            checksum: None,
        }
    }

    /// Gets the first document contained in this message.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .find_map(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { .. } => None,
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no response received from server".into(),
                }
                .into()
            })
    }

    /// Serializes this message into an OP_MSG frame, including the header.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut sections_bytes = Vec::new();
        for section in &self.sections {
            section.write(&mut sections_bytes)?;
        }

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections_bytes.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut frame = Vec::with_capacity(total_length);
        header.write_to(&mut frame);
        frame.extend(self.flags.bits().to_le_bytes());
        frame.extend(sections_bytes);
        if let Some(checksum) = self.checksum {
            frame.extend(checksum.to_le_bytes());
        }

        Ok(frame)
    }

    /// Serializes a `Command` into a legacy OP_QUERY frame against the `<db>.$cmd` collection.
    /// Used for the initial handshake, which may be speaking to a pre-OP_MSG server.
    pub(crate) fn encode_op_query(command: Command, request_id: i32) -> Result<Vec<u8>> {
        let mut body_bytes = Vec::new();
        command.body.to_writer(&mut body_bytes)?;

        let collection_name = format!("{}.$cmd", command.target_db);
        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + collection_name.len()
            + 1
            + 2 * std::mem::size_of::<i32>()
            + body_bytes.len();

        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut frame = Vec::with_capacity(total_length);
        header.write_to(&mut frame);
        frame.extend(QUERY_SECONDARY_OK.to_le_bytes());
        frame.extend(collection_name.as_bytes());
        frame.push(0);
        frame.extend(0i32.to_le_bytes()); // numberToSkip
        frame.extend((-1i32).to_le_bytes()); // numberToReturn
        frame.extend(body_bytes);

        Ok(frame)
    }

    /// Deserializes a message from a header and the remaining bytes of the frame.
    pub(crate) fn decode(header: Header, body: &[u8]) -> Result<Self> {
        if header.length as usize != Header::LENGTH + body.len() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the reply would be {} bytes long, but it instead \
                     was {}",
                    header.length,
                    Header::LENGTH + body.len(),
                ),
            }
            .into());
        }

        match header.op_code {
            OpCode::Message => Self::decode_op_msg(header, body),
            OpCode::Reply => Self::decode_op_reply(header, body),
            OpCode::Query => Err(ErrorKind::InvalidResponse {
                message: "received an OP_QUERY frame from the server".into(),
            }
            .into()),
        }
    }

    fn decode_op_msg(header: Header, body: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(body);

        let flags = MessageFlags::from_bits_truncate(read_u32(&mut reader)?);

        let checksum_length = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };

        let mut sections = Vec::new();
        while (body.len() - reader.position() as usize) > checksum_length {
            sections.push(MessageSection::read(&mut reader)?);
        }

        let mut checksum = None;
        if checksum_length > 0 {
            checksum = Some(read_u32(&mut reader)?);
        }

        if reader.position() as usize != body.len() {
            return Err(ErrorKind::InvalidResponse {
                message: "message length does not match the sum of its sections".into(),
            }
            .into());
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            sections,
            checksum,
        })
    }

    fn decode_op_reply(header: Header, body: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(body);

        // responseFlags, cursorId, and startingFrom are not consumed.
        let mut prelude = [0u8; 16];
        reader.read_exact(&mut prelude)?;

        let number_returned = read_i32(&mut reader)?;

        let mut sections = Vec::new();
        for _ in 0..number_returned {
            sections.push(MessageSection::Document(Document::from_reader(&mut reader)?));
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags: MessageFlags::empty(),
            sections,
            checksum: None,
        })
    }
}

/// The secondaryOk bit of the legacy OP_QUERY flags, set so the handshake can run against
/// non-primary members.
const QUERY_SECONDARY_OK: u32 = 0b100;

bitflags! {
    /// Represents the bitwise flags of an OP_MSG as defined in the spec.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read(reader: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let mut payload_type = [0u8];
        reader.read_exact(&mut payload_type)?;

        match payload_type[0] {
            0 => Ok(MessageSection::Document(Document::from_reader(reader)?)),
            1 => {
                let size = read_i32(reader)?;
                let end = reader
                    .position()
                    .checked_add((size as u64).saturating_sub(std::mem::size_of::<i32>() as u64))
                    .ok_or_else(invalid_section_length)?;

                let mut identifier_bytes = Vec::new();
                loop {
                    let mut byte = [0u8];
                    reader.read_exact(&mut byte)?;
                    if byte[0] == 0 {
                        break;
                    }
                    identifier_bytes.push(byte[0]);
                }
                let identifier = String::from_utf8(identifier_bytes).map_err(|_| {
                    ErrorKind::InvalidResponse {
                        message: "document sequence identifier is not valid UTF-8".into(),
                    }
                })?;

                let mut documents = Vec::new();
                while reader.position() < end {
                    documents.push(Document::from_reader(&mut *reader)?);
                }

                if reader.position() != end {
                    return Err(invalid_section_length());
                }

                Ok(MessageSection::Sequence {
                    identifier,
                    documents,
                })
            }
            other => Err(ErrorKind::InvalidResponse {
                message: format!("invalid section payload type: {}", other),
            }
            .into()),
        }
    }

    /// Serializes the MessageSection and appends the bytes to `buffer`.
    fn write(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                buffer.push(0);
                doc.to_writer(&mut *buffer)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                buffer.push(1);

                let mut contents = Vec::new();
                contents.extend(identifier.as_bytes());
                contents.push(0);
                for doc in documents {
                    doc.to_writer(&mut contents)?;
                }

                let size = (contents.len() + std::mem::size_of::<i32>()) as i32;
                buffer.extend(size.to_le_bytes());
                buffer.extend(contents);
            }
        }

        Ok(())
    }
}

fn invalid_section_length() -> crate::error::Error {
    ErrorKind::InvalidResponse {
        message: "document sequence length does not match its contents".into(),
    }
    .into()
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(reader: &mut impl Read) -> Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::cmap::conn::command::Command;

    fn round_trip(message: Message) {
        let frame = message.encode().unwrap();
        let header = Header::from_slice(&frame).unwrap();
        assert_eq!(header.length as usize, frame.len());
        let decoded = Message::decode(header, &frame[Header::LENGTH..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn op_msg_round_trip() {
        round_trip(Message {
            request_id: 7,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(
                doc! { "hello": 1, "$db": "admin" },
            )],
            checksum: None,
        });
    }

    #[test]
    fn op_msg_round_trip_with_sequence() {
        round_trip(Message {
            request_id: 1024,
            response_to: 0,
            flags: MessageFlags::EXHAUST_ALLOWED,
            sections: vec![
                MessageSection::Document(doc! { "insert": "coll", "$db": "db" }),
                MessageSection::Sequence {
                    identifier: "documents".to_string(),
                    documents: vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 3 }],
                },
            ],
            checksum: None,
        });
    }

    #[test]
    fn from_command_appends_db() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, 42);
        assert_eq!(message.request_id, 42);
        match &message.sections[0] {
            MessageSection::Document(doc) => {
                assert_eq!(doc.get_str("$db").unwrap(), "admin");
            }
            section => panic!("unexpected section {:?}", section),
        }
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let message = Message {
            request_id: 1,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(doc! { "ok": 1 })],
            checksum: None,
        };
        let frame = message.encode().unwrap();
        let mut header = Header::from_slice(&frame).unwrap();
        header.length += 4;
        assert!(Message::decode(header, &frame[Header::LENGTH..]).is_err());
    }

    #[test]
    fn decode_op_reply() {
        let mut body_bytes = Vec::new();
        body_bytes.extend(0i32.to_le_bytes()); // responseFlags
        body_bytes.extend(0i64.to_le_bytes()); // cursorId
        body_bytes.extend(0i32.to_le_bytes()); // startingFrom
        body_bytes.extend(1i32.to_le_bytes()); // numberReturned
        doc! { "ok": 1, "ismaster": true }
            .to_writer(&mut body_bytes)
            .unwrap();

        let header = Header {
            length: (Header::LENGTH + body_bytes.len()) as i32,
            request_id: 99,
            response_to: -2,
            op_code: OpCode::Reply,
        };

        let decoded = Message::decode(header, &body_bytes).unwrap();
        assert_eq!(decoded.response_to, -2);
        let doc = decoded.single_document_response().unwrap();
        assert_eq!(doc.get_bool("ismaster").unwrap(), true);
    }
}

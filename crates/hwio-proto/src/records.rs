use crate::{CodecError, ErrorCode, MAX_NAME_LEN};

/// Copies `s` into a fixed `MAX_NAME_LEN` buffer, null-terminated.
fn pack_name(s: &str) -> Result<[u8; MAX_NAME_LEN], CodecError> {
    let bytes = s.as_bytes();
    if bytes.len() >= MAX_NAME_LEN {
        return Err(CodecError::NameTooLong(MAX_NAME_LEN));
    }
    let mut buf = [0u8; MAX_NAME_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Reads a null-terminated (or fully-populated) name out of a fixed buffer.
/// Invalid UTF-8 is lossily replaced rather than rejected: a malformed name
/// string is a QUERY that simply won't match any device, not a framing
/// error.
fn unpack_name(buf: &[u8; MAX_NAME_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// One element of a QUERY body: a device spec string the server's bus
/// layer resolves into zero or more matching devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevQueryItem {
    pub name: String,
}

impl DevQueryItem {
    pub const WIRE_SIZE: usize = MAX_NAME_LEN;

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn encode(&self) -> Result<[u8; Self::WIRE_SIZE], CodecError> {
        pack_name(&self.name)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; MAX_NAME_LEN] = buf
            .get(..MAX_NAME_LEN)
            .ok_or(CodecError::BufferTooSmall { need: MAX_NAME_LEN, have: buf.len() })?
            .try_into()
            .unwrap();
        Ok(Self { name: unpack_name(&arr) })
    }

    /// Decodes `buf` as `n` contiguous `DevQueryItem` records. Callers are
    /// responsible for first checking `body_len == n * WIRE_SIZE`: this
    /// only decodes, it doesn't re-validate arity.
    pub fn decode_many(buf: &[u8], n: usize) -> Result<Vec<Self>, CodecError> {
        (0..n).map(|i| Self::decode(&buf[i * Self::WIRE_SIZE..])).collect()
    }
}

/// `READ` request body: `{offset: u32, size: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReq {
    pub offset: u32,
    pub size: u32,
}

impl ReadReq {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.offset.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.size.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(CodecError::BufferTooSmall { need: Self::WIRE_SIZE, have: buf.len() });
        }
        Ok(Self {
            offset: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

/// `WRITE` request: `{offset: u32, size: u32, data[size]}`. The fixed
/// prefix is decoded separately from the trailing `data`, since `data`'s
/// length is itself part of the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReqHeader {
    pub offset: u32,
    pub size: u32,
}

impl WriteReqHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.offset.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.size.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(CodecError::BufferTooSmall { need: Self::WIRE_SIZE, have: buf.len() });
        }
        Ok(Self {
            offset: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        })
    }

    /// Builds a full WRITE body (prefix + data) in one shot.
    pub fn encode_full(offset: u32, data: &[u8]) -> Vec<u8> {
        let header = Self { offset, size: data.len() as u32 };
        let mut body = Vec::with_capacity(Self::WIRE_SIZE + data.len());
        body.extend_from_slice(&header.encode());
        body.extend_from_slice(data);
        body
    }
}

/// `ERROR_MSG`/`MSG` body: `{err_code: u32, msg: [u8; MAX_NAME_LEN]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrMsg {
    pub err_code: u32,
    pub msg: String,
}

impl ErrMsg {
    pub const WIRE_SIZE: usize = 4 + MAX_NAME_LEN;

    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self { err_code: code.code(), msg: msg.into() }
    }

    /// Builds a message body with a caller-chosen code rather than one of
    /// [`ErrorCode`]'s fixed variants — used for the client-originated
    /// `MSG` command, which carries an application-defined code, not a
    /// protocol error code.
    pub fn new_raw(err_code: u32, msg: impl Into<String>) -> Self {
        Self { err_code, msg: msg.into() }
    }

    pub fn encode(&self) -> Result<[u8; Self::WIRE_SIZE], CodecError> {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.err_code.to_ne_bytes());
        let name = pack_name(&self.msg).unwrap_or_else(|_| {
            // truncate oversized diagnostic text rather than fail to send the error
            let mut truncated = [0u8; MAX_NAME_LEN];
            let take = self.msg.len().min(MAX_NAME_LEN - 1);
            truncated[..take].copy_from_slice(&self.msg.as_bytes()[..take]);
            truncated
        });
        buf[4..].copy_from_slice(&name);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(CodecError::BufferTooSmall { need: Self::WIRE_SIZE, have: buf.len() });
        }
        let err_code = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let name_buf: [u8; MAX_NAME_LEN] = buf[4..].try_into().unwrap();
        Ok(Self { err_code, msg: unpack_name(&name_buf) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_query_item_round_trip() {
        let item = DevQueryItem::new("gpio0");
        let bytes = item.encode().unwrap();
        assert_eq!(DevQueryItem::decode(&bytes).unwrap(), item);
    }

    #[test]
    fn dev_query_item_rejects_oversized_name() {
        let long = "x".repeat(MAX_NAME_LEN);
        assert_eq!(DevQueryItem::new(long).encode(), Err(CodecError::NameTooLong(MAX_NAME_LEN)));
    }

    #[test]
    fn decode_many_reads_contiguous_records() {
        let items = vec![DevQueryItem::new("a"), DevQueryItem::new("b")];
        let mut buf = Vec::new();
        for i in &items {
            buf.extend_from_slice(&i.encode().unwrap());
        }
        assert_eq!(DevQueryItem::decode_many(&buf, 2).unwrap(), items);
    }

    #[test]
    fn read_req_round_trip() {
        let req = ReadReq { offset: 4, size: 16 };
        assert_eq!(ReadReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn write_req_full_round_trip() {
        let data = [1u8, 2, 3, 4];
        let body = WriteReqHeader::encode_full(8, &data);
        let header = WriteReqHeader::decode(&body).unwrap();
        assert_eq!(header, WriteReqHeader { offset: 8, size: 4 });
        assert_eq!(&body[WriteReqHeader::WIRE_SIZE..], &data);
    }

    #[test]
    fn err_msg_round_trip() {
        let e = ErrMsg::new(ErrorCode::AccessDenied, "not yours");
        let bytes = e.encode().unwrap();
        assert_eq!(ErrMsg::decode(&bytes).unwrap(), e);
    }
}

use std::collections::HashSet;

use hwio_bus::{Bus, BusDeviceId, BusError};
use hwio_proto::{
    Command, DevQueryItem, ErrMsg, ErrorCode, Header, ReadReq, WriteReqHeader, BUFFER_SIZE,
    HEADER_SIZE, MAX_ITEMS_PER_QUERY,
};
use tracing::warn;

use crate::registry::ClientRegistry;

/// Outcome of dispatching a single request.
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Fully framed response bytes (header + body) to write back, if any.
    pub reply: Option<Vec<u8>>,
    /// Whether the caller should tear the client down after sending the
    /// reply (set only for `BYE`; fatal errors are signalled separately by
    /// the transport layer, not through this type).
    pub disconnect: bool,
}

impl DispatchResult {
    fn reply(bytes: Vec<u8>) -> Self {
        Self { reply: Some(bytes), disconnect: false }
    }

    fn bye() -> Self {
        Self { reply: None, disconnect: true }
    }

    fn none() -> Self {
        Self { reply: None, disconnect: false }
    }
}

fn error_frame(code: ErrorCode, msg: impl Into<String>) -> Vec<u8> {
    let body = ErrMsg::new(code, msg).encode().unwrap_or_else(|_| {
        ErrMsg::new(code, "").encode().expect("empty message always fits")
    });
    let header = Header::session(Command::ErrorMsg, body.len() as u16);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn ok_frame(command: Command, dev_id: u32, body: &[u8]) -> Vec<u8> {
    let header = Header::new(command, body.len() as u16, dev_id);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(body);
    frame
}

/// Reply for a header whose command code is outside the closed set.
/// Framing is still intact at this point, so the session continues.
pub fn unknown_command_reply() -> Vec<u8> {
    error_frame(ErrorCode::UnknownCommand, "unknown command")
}

/// Dispatches one fully-read request, mutating device ownership on
/// `registry` as needed, and returns the frame to send back (if any) plus
/// whether the session should close.
pub fn dispatch(
    registry: &mut ClientRegistry,
    client_id: usize,
    bus: &dyn Bus,
    header: Header,
    body: &[u8],
) -> DispatchResult {
    match header.command {
        Command::PingRequest => handle_ping(header),
        Command::Query => handle_query(registry, client_id, bus, header, body),
        Command::Read => handle_read(registry, client_id, bus, header, body),
        Command::Write => handle_write(registry, client_id, bus, header, body),
        Command::RemoteCall => handle_remote_call(registry, client_id, bus, header, body),
        Command::Bye => DispatchResult::bye(),
        Command::Msg => {
            handle_msg(body);
            DispatchResult::none()
        }
        // Server->client-only commands arriving from a client break framing
        // expectations but not the framing itself: treat as malformed.
        Command::PingReply
        | Command::QueryReply
        | Command::ReadReply
        | Command::WriteReply
        | Command::RemoteCallReply
        | Command::ErrorMsg => {
            DispatchResult::reply(error_frame(ErrorCode::MalformedPacket, "unexpected direction"))
        }
    }
}

fn handle_ping(header: Header) -> DispatchResult {
    if header.body_len != 0 {
        return DispatchResult::reply(error_frame(
            ErrorCode::MalformedPacket,
            "PING_REQUEST: body_len must be 0",
        ));
    }
    DispatchResult::reply(ok_frame(Command::PingReply, 0, &[]))
}

fn handle_query(
    registry: &mut ClientRegistry,
    client_id: usize,
    bus: &dyn Bus,
    header: Header,
    body: &[u8],
) -> DispatchResult {
    let item_size = DevQueryItem::WIRE_SIZE;
    if header.body_len as usize % item_size != 0 {
        return DispatchResult::reply(error_frame(
            ErrorCode::MalformedPacket,
            format!("QUERY: body_len {} not a multiple of {item_size}", header.body_len),
        ));
    }
    let n = header.body_len as usize / item_size;
    if n == 0 || n > MAX_ITEMS_PER_QUERY {
        return DispatchResult::reply(error_frame(
            ErrorCode::UnknownCommand,
            format!("QUERY: unsupported item count {n}"),
        ));
    }
    let items = match DevQueryItem::decode_many(body, n) {
        Ok(items) => items,
        Err(e) => {
            return DispatchResult::reply(error_frame(
                ErrorCode::MalformedPacket,
                format!("QUERY: {e}"),
            ));
        }
    };

    // Devices that already matched are only considered once, even if more
    // than one query item names them. Devices owned by a different client
    // are silently excluded from the reply rather than rejected: a
    // concurrent query racing someone else's reservation is normal, not a
    // protocol error.
    let mut seen = HashSet::new();
    let mut matched = Vec::new();
    for item in &items {
        for id in bus.query(&item.name) {
            if seen.insert(id) && registry.try_reserve(client_id, id) {
                matched.push(id);
            }
        }
    }

    if let Some(client) = registry.client_by_id_mut(client_id) {
        client.last_query = matched.clone();
    }

    let mut reply_body = Vec::with_capacity(matched.len() * 4);
    for id in &matched {
        reply_body.extend_from_slice(&id.0.to_ne_bytes());
    }
    DispatchResult::reply(ok_frame(Command::QueryReply, 0, &reply_body))
}

fn handle_read(
    registry: &ClientRegistry,
    client_id: usize,
    bus: &dyn Bus,
    header: Header,
    body: &[u8],
) -> DispatchResult {
    let dev = BusDeviceId(header.dev_id);
    if !registry.is_owned_by(dev, client_id) {
        return DispatchResult::reply(error_frame(ErrorCode::AccessDenied, "device not owned"));
    }
    let req = match ReadReq::decode(body) {
        Ok(req) => req,
        Err(e) => {
            return DispatchResult::reply(error_frame(
                ErrorCode::MalformedPacket,
                format!("READ: {e}"),
            ));
        }
    };
    let max_body = (BUFFER_SIZE - HEADER_SIZE) as u32;
    if req.size > max_body {
        return DispatchResult::reply(error_frame(
            ErrorCode::MalformedPacket,
            format!("READ: requested size {} exceeds {max_body}", req.size),
        ));
    }
    match bus.read(dev, req.offset, req.size) {
        Ok(data) => DispatchResult::reply(ok_frame(Command::ReadReply, header.dev_id, &data)),
        Err(BusError::UnknownDevice(_)) => {
            DispatchResult::reply(error_frame(ErrorCode::UnknownDevice, "device vanished"))
        }
        Err(e) => DispatchResult::reply(error_frame(ErrorCode::Internal, e.to_string())),
    }
}

fn handle_write(
    registry: &ClientRegistry,
    client_id: usize,
    bus: &dyn Bus,
    header: Header,
    body: &[u8],
) -> DispatchResult {
    let dev = BusDeviceId(header.dev_id);
    if !registry.is_owned_by(dev, client_id) {
        return DispatchResult::reply(error_frame(ErrorCode::AccessDenied, "device not owned"));
    }
    let prefix = match WriteReqHeader::decode(body) {
        Ok(prefix) => prefix,
        Err(e) => {
            return DispatchResult::reply(error_frame(
                ErrorCode::MalformedPacket,
                format!("WRITE: {e}"),
            ));
        }
    };
    let expected_len = WriteReqHeader::WIRE_SIZE + prefix.size as usize;
    if body.len() != expected_len {
        return DispatchResult::reply(error_frame(
            ErrorCode::MalformedPacket,
            format!("WRITE: body length {} != declared {expected_len}", body.len()),
        ));
    }
    let data = &body[WriteReqHeader::WIRE_SIZE..];
    match bus.write(dev, prefix.offset, data) {
        Ok(()) => DispatchResult::reply(ok_frame(Command::WriteReply, header.dev_id, &[])),
        Err(BusError::UnknownDevice(_)) => {
            DispatchResult::reply(error_frame(ErrorCode::UnknownDevice, "device vanished"))
        }
        Err(e) => DispatchResult::reply(error_frame(ErrorCode::Internal, e.to_string())),
    }
}

fn handle_remote_call(
    registry: &ClientRegistry,
    client_id: usize,
    bus: &dyn Bus,
    header: Header,
    body: &[u8],
) -> DispatchResult {
    let dev = BusDeviceId(header.dev_id);
    if !registry.is_owned_by(dev, client_id) {
        return DispatchResult::reply(error_frame(ErrorCode::AccessDenied, "device not owned"));
    }
    match bus.remote_call(dev, body) {
        Ok(reply) => {
            DispatchResult::reply(ok_frame(Command::RemoteCallReply, header.dev_id, &reply))
        }
        Err(BusError::UnknownDevice(_)) => {
            DispatchResult::reply(error_frame(ErrorCode::UnknownDevice, "device vanished"))
        }
        Err(e) => DispatchResult::reply(error_frame(ErrorCode::Internal, e.to_string())),
    }
}

fn handle_msg(body: &[u8]) {
    match ErrMsg::decode(body) {
        Ok(msg) => warn!(code = msg.err_code, msg = %msg.msg, "client message"),
        Err(_) => warn!(len = body.len(), "client message (unparseable body)"),
    }
}

#[cfg(test)]
mod tests {
    use hwio_bus::MockBus;

    use super::*;
    use crate::registry::ClientRegistry;

    fn ping(body_len: u16) -> Header {
        Header::session(Command::PingRequest, body_len)
    }

    #[test]
    fn ping_round_trip_l2() {
        let bus = MockBus::new();
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);
        for _ in 0..3 {
            let r = dispatch(&mut reg, client, &bus, ping(0), &[]);
            let reply = r.reply.unwrap();
            let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
            assert_eq!(h.command, Command::PingReply);
            assert_eq!(h.body_len, 0);
        }
    }

    #[test]
    fn ping_with_body_is_malformed() {
        let bus = MockBus::new();
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);
        let r = dispatch(&mut reg, client, &bus, ping(4), &[0, 0, 0, 0]);
        let reply = r.reply.unwrap();
        let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(h.command, Command::ErrorMsg);
    }

    #[test]
    fn query_then_read_scenario_2() {
        let bus = MockBus::new();
        let dev = bus.add_device("gpio0", 16);
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);

        let item = DevQueryItem::new("gpio0");
        let body = item.encode().unwrap();
        let header = Header::session(Command::Query, body.len() as u16);
        let r = dispatch(&mut reg, client, &bus, header, &body);
        let reply = r.reply.unwrap();
        let reply_header = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(reply_header.command, Command::QueryReply);
        let handle = u32::from_ne_bytes(reply[hwio_proto::HEADER_SIZE..].try_into().unwrap());
        assert_eq!(handle, dev.0);

        let read_body = ReadReq { offset: 0, size: 4 }.encode();
        let read_header = Header::new(Command::Read, read_body.len() as u16, handle);
        let r = dispatch(&mut reg, client, &bus, read_header, &read_body);
        let reply = r.reply.unwrap();
        let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(h.command, Command::ReadReply);
        assert_eq!(h.body_len, 4);
    }

    #[test]
    fn read_request_larger_than_buffer_size_is_malformed() {
        let bus = MockBus::new();
        let dev = bus.add_device("reg", 70_000);
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);
        reg.try_reserve(client, dev);

        let read_body = ReadReq { offset: 0, size: 70_000 }.encode();
        let read_header = Header::new(Command::Read, read_body.len() as u16, dev.0);
        let r = dispatch(&mut reg, client, &bus, read_header, &read_body);
        let reply = r.reply.unwrap();
        let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(h.command, Command::ErrorMsg);
        let err = ErrMsg::decode(&reply[hwio_proto::HEADER_SIZE..]).unwrap();
        assert_eq!(err.err_code, ErrorCode::MalformedPacket.code());
        assert_eq!((h.body_len as usize) + hwio_proto::HEADER_SIZE, reply.len());
    }

    #[test]
    fn read_without_ownership_is_access_denied_scenario_3() {
        let bus = MockBus::new();
        let dev = bus.add_device("gpio0", 16);
        let mut reg = ClientRegistry::new();
        let owner = reg.add_client(1);
        let other = reg.add_client(2);
        reg.try_reserve(owner, dev);

        let read_body = ReadReq { offset: 0, size: 4 }.encode();
        let read_header = Header::new(Command::Read, read_body.len() as u16, dev.0);
        let r = dispatch(&mut reg, other, &bus, read_header, &read_body);
        let reply = r.reply.unwrap();
        let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(h.command, Command::ErrorMsg);
        let err = ErrMsg::decode(&reply[hwio_proto::HEADER_SIZE..]).unwrap();
        assert_eq!(err.err_code, ErrorCode::AccessDenied.code());
        assert!(reg.check_invariants());
    }

    #[test]
    fn malformed_query_body_len_scenario_4() {
        let bus = MockBus::new();
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);
        let header = Header::session(Command::Query, 3);
        let r = dispatch(&mut reg, client, &bus, header, &[0, 0, 0]);
        let reply = r.reply.unwrap();
        let h = Header::decode(&reply[..hwio_proto::HEADER_SIZE]).unwrap();
        assert_eq!(h.command, Command::ErrorMsg);
        let err = ErrMsg::decode(&reply[hwio_proto::HEADER_SIZE..]).unwrap();
        assert_eq!(err.err_code, ErrorCode::MalformedPacket.code());
        assert!(!r.disconnect, "malformed query must not end the session");
    }

    #[test]
    fn bye_signals_disconnect_with_no_reply_scenario_6() {
        let bus = MockBus::new();
        let mut reg = ClientRegistry::new();
        let client = reg.add_client(1);
        let r = dispatch(&mut reg, client, &bus, Header::session(Command::Bye, 0), &[]);
        assert!(r.disconnect);
        assert!(r.reply.is_none());
    }
}

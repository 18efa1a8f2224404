use crate::CodecError;

/// Closed set of command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    PingRequest = 1,
    PingReply = 2,
    Query = 3,
    QueryReply = 4,
    Read = 5,
    ReadReply = 6,
    Write = 7,
    WriteReply = 8,
    RemoteCall = 9,
    RemoteCallReply = 10,
    Bye = 11,
    Msg = 12,
    ErrorMsg = 13,
}

impl Command {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = CodecError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Command::PingRequest,
            2 => Command::PingReply,
            3 => Command::Query,
            4 => Command::QueryReply,
            5 => Command::Read,
            6 => Command::ReadReply,
            7 => Command::Write,
            8 => Command::WriteReply,
            9 => Command::RemoteCall,
            10 => Command::RemoteCallReply,
            11 => Command::Bye,
            12 => Command::Msg,
            13 => Command::ErrorMsg,
            other => return Err(CodecError::UnknownCommand(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_known_code() {
        let all = [
            Command::PingRequest,
            Command::PingReply,
            Command::Query,
            Command::QueryReply,
            Command::Read,
            Command::ReadReply,
            Command::Write,
            Command::WriteReply,
            Command::RemoteCall,
            Command::RemoteCallReply,
            Command::Bye,
            Command::Msg,
            Command::ErrorMsg,
        ];
        for cmd in all {
            assert_eq!(Command::try_from(cmd.code()).unwrap(), cmd);
        }
    }

    #[test]
    fn rejects_unknown_code() {
        assert_eq!(Command::try_from(255), Err(CodecError::UnknownCommand(255)));
    }
}

/// Broad classes of failure, used to decide how far an error should travel.
///
/// Codec errors abort a single decode. Protocol and transport errors end the
/// one connection that raised them; other connections keep going. Scheduling
/// errors describe work that could not be completed by the swarm as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Codec,
    Protocol,
    Transport,
    Scheduling,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Codec => "codec",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Scheduling => "scheduling",
        };
        f.write_str(name)
    }
}

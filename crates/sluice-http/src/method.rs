/// Request methods accepted on the wire, WebDAV verbs included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Copy,
    Delete,
    Get,
    Head,
    Lock,
    Mkcol,
    Move,
    Options,
    Post,
    Propfind,
    Proppatch,
    Put,
    Trace,
    Unlock,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "COPY" => Self::Copy,
            "DELETE" => Self::Delete,
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "LOCK" => Self::Lock,
            "MKCOL" => Self::Mkcol,
            "MOVE" => Self::Move,
            "OPTIONS" => Self::Options,
            "POST" => Self::Post,
            "PROPFIND" => Self::Propfind,
            "PROPPATCH" => Self::Proppatch,
            "PUT" => Self::Put,
            "TRACE" => Self::Trace,
            "UNLOCK" => Self::Unlock,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "COPY",
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Lock => "LOCK",
            Self::Mkcol => "MKCOL",
            Self::Move => "MOVE",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Propfind => "PROPFIND",
            Self::Proppatch => "PROPPATCH",
            Self::Put => "PUT",
            Self::Trace => "TRACE",
            Self::Unlock => "UNLOCK",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

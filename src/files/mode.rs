use std::fs::OpenOptions;

/// A C `fopen` mode string (`r`, `w+`, `ab`, `a+`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    kind: Kind,
    update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Append,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Option<Self> {
        let mut chars = mode.chars();
        let kind = match chars.next()? {
            'r' => Kind::Read,
            'w' => Kind::Write,
            'a' => Kind::Append,
            _ => return None,
        };
        let mut update = false;
        for c in chars {
            match c {
                '+' => update = true,
                'b' | 't' => {}
                _ => return None,
            }
        }
        Some(Self { kind, update })
    }

    pub fn readable(self) -> bool {
        self.kind == Kind::Read || self.update
    }

    pub fn writable(self) -> bool {
        self.kind != Kind::Read || self.update
    }

    /// `w` and `a` create the file when it is missing.
    pub fn creates(self) -> bool {
        self.kind != Kind::Read
    }

    pub fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.readable());
        match self.kind {
            Kind::Read => {
                opts.write(self.update);
            }
            Kind::Write => {
                opts.write(true).create(true).truncate(true);
            }
            Kind::Append => {
                opts.append(true).create(true);
            }
        }
        opts
    }

    /// Options for a private copy: same access, created if missing. The
    /// caller empties it (append forbids `truncate`).
    pub fn copy_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.readable()).create(true);
        if self.kind == Kind::Append {
            opts.append(true);
        } else {
            opts.write(true);
        }
        opts
    }
}

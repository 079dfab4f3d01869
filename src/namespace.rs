use std::{fmt, str::FromStr};

use crate::error::{Error, ErrorKind};

/// A struct modeling the canonical name for a collection: the name of the database it belongs to
/// and the name of the collection itself, rendered as `"<db>.<coll>"`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from the given database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid namespace specification {:?}", s),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Namespace;

    #[test]
    fn parses_first_dot_as_separator() {
        let ns: Namespace = "db.coll.with.dots".parse().unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "coll.with.dots");
        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }
}

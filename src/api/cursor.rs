//! Resume cursors into the change streams.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de;

use crate::commons::error::Error;

use super::event::ResourceKind;


//------------ Cursor --------------------------------------------------------

/// A position in the change stream of a single resource kind.
///
/// Cursors are ordered by the cluster time of the change and, for changes
/// with the same time, by their index within that second. On the wire they
/// are opaque base64 strings.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Cursor {
    resource: ResourceKind,
    cluster_time: i64,
    index: u32,
}

impl Cursor {
    pub fn new(resource: ResourceKind, cluster_time: i64, index: u32) -> Self {
        Cursor { resource, cluster_time, index }
    }

    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    pub fn cluster_time(&self) -> i64 {
        self.cluster_time
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{}:{}:{}", self.resource, self.cluster_time, self.index
        ))
    }

    /// Returns the oldest of the given cursors.
    pub fn oldest<'a>(
        cursors: impl IntoIterator<Item = &'a Cursor>
    ) -> Option<&'a Cursor> {
        cursors.into_iter().min()
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cluster_time, self.index)
            .cmp(&(other.cluster_time, other.index))
            .then_with(|| self.resource.cmp(&other.resource))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidCursor(s.to_string());

        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| invalid())?;
        let decoded = String::from_utf8(bytes).map_err(|_| invalid())?;

        let mut parts = decoded.splitn(3, ':');
        let resource = parts.next().ok_or_else(invalid)?;
        let time = parts.next().ok_or_else(invalid)?;
        let index = parts.next().ok_or_else(invalid)?;

        Ok(Cursor {
            resource: ResourceKind::from_str(resource)
                .map_err(|_| invalid())?,
            cluster_time: time.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.encode().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        Cursor::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_parse() {
        let cursor = Cursor::new(ResourceKind::HostRelation, 1_700_000_000, 3);
        let encoded = cursor.encode();
        assert!(!encoded.contains(':'));
        assert_eq!(Cursor::from_str(&encoded).unwrap(), cursor);

        assert!(Cursor::from_str("not a cursor").is_err());
        assert!(Cursor::from_str(&URL_SAFE_NO_PAD.encode("host:x:1")).is_err());
    }

    #[test]
    fn order_by_time_then_index() {
        let a = Cursor::new(ResourceKind::Host, 10, 5);
        let b = Cursor::new(ResourceKind::Host, 11, 0);
        let c = Cursor::new(ResourceKind::Host, 11, 1);
        assert!(a < b && b < c);
        assert_eq!(Cursor::oldest([&c, &a, &b]), Some(&a));
        assert_eq!(Cursor::oldest(Vec::<&Cursor>::new()), None);
    }
}

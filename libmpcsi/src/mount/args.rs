//! Mount arguments passed to the Mountpoint Pod's filesystem client.

use std::collections::BTreeMap;
use std::fmt;

/// Mount the bucket read-only.
pub const READ_ONLY: &str = "--read-only";
/// Keep the filesystem client in the foreground.  Never valid in a
/// Mountpoint Pod, which supervises the client itself.
pub const FOREGROUND: &str = "--foreground";
/// Short form of [`FOREGROUND`].
pub const FOREGROUND_SHORT: &str = "-f";
/// Bucket region.
pub const REGION: &str = "--region";

/// A de-duplicated set of `--key[=value]` flags.
///
/// Parsing normalizes the syntax users write in `mountOptions`:
///
/// | input          | normalized       |
/// |----------------|------------------|
/// | `allow-delete` | `--allow-delete` |
/// | `--uid 1000`   | `--uid=1000`     |
/// | ` -f `         | `-f`             |
///
/// A later occurrence of a key replaces an earlier one.  Rendering is sorted
/// by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    args: BTreeMap<String, Option<String>>,
}

impl MountArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and normalize a list of raw flags.
    pub fn parse<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::new();
        for flag in flags {
            args.insert(flag.as_ref());
        }
        args
    }

    /// Insert one raw flag, replacing any previous value for its key.
    pub fn insert(&mut self, flag: &str) {
        if let Some((key, value)) = normalize(flag) {
            self.args.insert(key, value);
        }
    }

    /// Remove `key` (already normalized, e.g. `--foreground`), returning
    /// whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.args.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    /// Value of `key`, `None` when absent or given without a value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Render the flags, sorted by key.
    pub fn to_vec(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}={value}"),
                None => key.clone(),
            })
            .collect()
    }
}

impl fmt::Display for MountArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_vec().join(" "))
    }
}

fn normalize(flag: &str) -> Option<(String, Option<String>)> {
    let flag = flag.trim();
    if flag.is_empty() {
        return None;
    }

    let split = flag
        .char_indices()
        .find(|&(_, c)| c == '=' || c.is_whitespace());
    let (key, value) = match split {
        Some((idx, sep)) => {
            let value = flag[idx + sep.len_utf8()..].trim();
            (&flag[..idx], (!value.is_empty()).then(|| value.to_owned()))
        }
        None => (flag, None),
    };

    let key = if key.starts_with('-') {
        key.to_owned()
    } else {
        format!("--{key}")
    };
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_sorts() {
        let args = MountArgs::parse(["foo", "bar", "--test 123"]);
        assert_eq!(args.to_vec(), vec!["--bar", "--foo", "--test=123"]);
    }

    #[test]
    fn duplicate_keys_collapse() {
        let args = MountArgs::parse(["--uid=1", "uid 2", "  --uid=3  ", "allow-other", "--allow-other"]);
        assert_eq!(args.to_vec(), vec!["--allow-other", "--uid=3"]);
    }

    #[test]
    fn short_flags_are_kept() {
        let mut args = MountArgs::parse(["-f", "--foreground", "foreground"]);
        assert_eq!(args.len(), 2);
        assert!(args.remove(FOREGROUND));
        assert!(args.remove(FOREGROUND_SHORT));
        assert!(args.is_empty());
    }

    #[test]
    fn empty_flags_are_ignored() {
        let args = MountArgs::parse(["", "   "]);
        assert!(args.is_empty());
    }

    #[test]
    fn values() {
        let args = MountArgs::parse(["region=eu-west-1", "read-only"]);
        assert_eq!(args.value(REGION), Some("eu-west-1"));
        assert!(args.contains(READ_ONLY));
        assert_eq!(args.value(READ_ONLY), None);
        assert_eq!(args.to_string(), "--read-only --region=eu-west-1");
    }
}

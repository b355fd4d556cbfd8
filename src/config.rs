//! INI configuration parsing: `[tftp]` server settings and `[board:SERIAL]`
//! client bindings, plus `includedir` glob expansion.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// A Raspberry Pi's serial number, normalized for matching: lowercased, and
/// with the leading `10000000` prefix of a 16-hex-digit serial stripped
/// (the firmware sometimes presents the full 16 digits, sometimes just the
/// trailing 8 -- both forms must resolve to the same board).
pub fn canonical_serial(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.len() == 16 && lower.starts_with("10000000") {
        lower[8..].to_string()
    } else {
        lower
    }
}

#[derive(Debug, Clone)]
pub struct Board {
    pub serial: String,
    pub image: PathBuf,
    pub partition: u32,
    pub ip: Option<IpAddr>,
}

impl Board {
    /// Parse a `--board SERIAL,PATH[,PART[,IP]]` CLI argument. Mirrors the
    /// `[board:SERIAL]` INI section's defaults: partition 1, no IP ACL.
    pub fn parse_cli(raw: &str) -> Result<Board, Error> {
        let mut parts = raw.splitn(4, ',');
        let serial = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidBoardArg(raw.to_string()))?;
        let image = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidBoardArg(raw.to_string()))?;
        let partition = match parts.next() {
            Some(v) => v
                .parse::<u32>()
                .map_err(|_| Error::InvalidBoardArg(raw.to_string()))?,
            None => 1,
        };
        let ip = match parts.next() {
            Some(v) => Some(
                v.parse::<IpAddr>()
                    .map_err(|_| Error::InvalidBoardArg(raw.to_string()))?,
            ),
            None => None,
        };
        Ok(Board {
            serial: canonical_serial(serial),
            image: PathBuf::from(image),
            partition,
            ip,
        })
    }
}

/// The process-wide set of configured boards, immutable once built. Wrapped
/// in an `ArcSwap` by the caller so a SIGHUP can atomically replace it.
#[derive(Debug, Default, Clone)]
pub struct BoardRegistry {
    boards: HashMap<String, Board>,
}

impl BoardRegistry {
    /// Build a registry directly from a pre-keyed map. Used by the boot
    /// server's own tests, which need a registry without going through INI
    /// parsing.
    #[cfg(test)]
    pub(crate) fn from_map(boards: HashMap<String, Board>) -> BoardRegistry {
        BoardRegistry { boards }
    }

    /// Look up a board by serial, in whichever of the two canonical forms
    /// the caller has.
    pub fn get(&self, serial: &str) -> Option<&Board> {
        self.boards.get(&canonical_serial(serial))
    }

    /// The sole configured board, if there is exactly one -- used as the
    /// fallback when a client's RRQ filename carries no serial prefix at
    /// all (the Pi firmware's documented behavior when serial lookup fails
    /// locally).
    pub fn default_board(&self) -> Option<&Board> {
        if self.boards.len() == 1 {
            self.boards.values().next()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Apply `--board` CLI overrides on top of the file-configured boards.
    /// A board named on the command line entirely replaces a same-serial
    /// section from the config file, the same way a later config file
    /// replaces an earlier one in `load_into`.
    pub fn with_cli_boards(mut self, extra: impl IntoIterator<Item = Board>) -> BoardRegistry {
        for board in extra {
            self.boards.insert(board.serial.clone(), board);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub port: String,
    pub boards: std::sync::Arc<BoardRegistry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0".to_string(),
            port: "69".to_string(),
            boards: std::sync::Arc::new(BoardRegistry::default()),
        }
    }
}

/// Parse the configuration rooted at `path`, following `includedir` globs.
/// Later files (in lexicographic order within a directory, and included
/// files relative to their including file) override earlier keys and add
/// to the board set; a board section redefined later entirely replaces the
/// earlier one.
pub fn load(path: &Path) -> Result<ServerConfig, Error> {
    let mut listen = "0.0.0.0".to_string();
    let mut port = "69".to_string();
    let mut boards = HashMap::new();
    load_into(path, &mut listen, &mut port, &mut boards)?;
    Ok(ServerConfig {
        listen,
        port,
        boards: std::sync::Arc::new(BoardRegistry { boards }),
    })
}

fn load_into(
    path: &Path,
    listen: &mut String,
    port: &mut String,
    boards: &mut HashMap<String, Board>,
) -> Result<(), Error> {
    let ini = ini::Ini::load_from_file(path).map_err(|source| match source {
        ini::Error::Io(source) => Error::ConfigRead {
            path: path.display().to_string(),
            source,
        },
        parse => Error::ConfigParse {
            path: path.display().to_string(),
            source: parse,
        },
    })?;

    let mut includedir = None;
    if let Some(section) = ini.section(Some("tftp")) {
        if let Some(v) = section.get("listen") {
            *listen = v.to_string();
        }
        if let Some(v) = section.get("port") {
            *port = v.to_string();
        }
        if let Some(pattern) = section.get("includedir") {
            includedir = Some(pattern.to_string());
        }
    }

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for (section_name, properties) in ini.iter() {
        let Some(section_name) = section_name else {
            continue;
        };
        let Some(serial) = section_name.strip_prefix("board:") else {
            continue;
        };
        let serial = canonical_serial(serial);

        let image_raw = properties
            .get("image")
            .ok_or_else(|| Error::MissingImage {
                serial: serial.clone(),
            })?;
        let image = {
            let p = PathBuf::from(image_raw);
            if p.is_absolute() {
                p
            } else {
                base_dir.join(p)
            }
        };

        let partition = match properties.get("partition") {
            Some(v) => v.parse::<u32>().map_err(|_| Error::InvalidPartition {
                serial: serial.clone(),
                value: v.to_string(),
            })?,
            None => 1,
        };

        let ip = match properties.get("ip") {
            Some(v) => Some(v.parse::<IpAddr>().map_err(|_| Error::InvalidIp {
                serial: serial.clone(),
                value: v.to_string(),
            })?),
            None => None,
        };

        boards.insert(
            serial.clone(),
            Board {
                serial,
                image,
                partition,
                ip,
            },
        );
    }

    // Applied last: an `includedir` pulls in files that are logically
    // "later" than this one, so their listen/port/board settings take
    // precedence over this file's own, same as two top-level files listed
    // in sequence would.
    if let Some(pattern) = includedir {
        load_includes(path, &pattern, listen, port, boards)?;
    }

    Ok(())
}

fn load_includes(
    including_file: &Path,
    pattern: &str,
    listen: &mut String,
    port: &mut String,
    boards: &mut HashMap<String, Board>,
) -> Result<(), Error> {
    let base_dir = including_file.parent().unwrap_or_else(|| Path::new("."));
    let dir = {
        let p = PathBuf::from(pattern);
        if p.is_absolute() {
            p
        } else {
            base_dir.join(p)
        }
    };
    let full_pattern = dir.join("*.conf");
    let full_pattern = full_pattern.to_string_lossy().to_string();

    let mut paths: Vec<PathBuf> = glob::glob(&full_pattern)
        .map_err(|source| Error::InvalidGlob {
            pattern: full_pattern.clone(),
            source,
        })?
        .filter_map(Result::ok)
        .collect();
    paths.sort();

    for included in paths {
        load_into(&included, listen, port, boards)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_10000000_prefix() {
        assert_eq!(canonical_serial("10000000abcdef12"), "abcdef12");
        assert_eq!(canonical_serial("ABCDEF12"), "abcdef12");
    }

    #[test]
    fn leaves_non_padded_serials_alone() {
        assert_eq!(canonical_serial("deadbeef"), "deadbeef");
        // 16 hex digits but not the reserved prefix: left untouched (lowercased).
        assert_eq!(
            canonical_serial("FFFFFFFFabcdef12"),
            "ffffffffabcdef12"
        );
    }

    #[test]
    fn registry_matches_either_serial_form() {
        let mut boards = HashMap::new();
        boards.insert(
            "abcdef12".to_string(),
            Board {
                serial: "abcdef12".to_string(),
                image: PathBuf::from("/tmp/x.img"),
                partition: 1,
                ip: None,
            },
        );
        let registry = BoardRegistry { boards };
        assert!(registry.get("abcdef12").is_some());
        assert!(registry.get("10000000abcdef12").is_some());
        assert!(registry.get("ABCDEF12").is_some());
        assert!(registry.get("not-a-match").is_none());
    }

    #[test]
    fn default_board_only_when_exactly_one_configured() {
        let mut boards = HashMap::new();
        assert!(BoardRegistry { boards: boards.clone() }.default_board().is_none());
        boards.insert(
            "a".to_string(),
            Board {
                serial: "a".to_string(),
                image: PathBuf::from("/tmp/a.img"),
                partition: 1,
                ip: None,
            },
        );
        assert!(BoardRegistry { boards: boards.clone() }.default_board().is_some());
        boards.insert(
            "b".to_string(),
            Board {
                serial: "b".to_string(),
                image: PathBuf::from("/tmp/b.img"),
                partition: 1,
                ip: None,
            },
        );
        assert!(BoardRegistry { boards }.default_board().is_none());
    }
}

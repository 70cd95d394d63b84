// Configuration: INI-style files plus command-line board definitions.
//
// Files are searched at /etc, /usr/local/etc and $XDG_CONFIG_HOME, later
// locations overriding earlier ones. A `[tftp]` section sets the listening
// address and port; each `[board:SERIAL]` section binds a Pi serial number
// to an image, a partition and an optional source-address check.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfError {
    Io(PathBuf, std::io::Error),
    Parse { path: PathBuf, line: usize, msg: String },
    Invalid(String),
}

impl error::Error for ConfError {}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfError::Io(path, e) => write!(f, "{}: {e}", path.display()),
            ConfError::Parse { path, line, msg } => {
                write!(f, "{}:{line}: {msg}", path.display())
            }
            ConfError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

/// One configured board: the serial number the bootloader will present,
/// the image to serve, which partition of it holds the boot files, and an
/// optional address the client must call from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub serial: u32,
    pub image: PathBuf,
    pub partition: u32,
    pub ip: Option<IpAddr>,
}

impl Board {
    /// Parses the `--board SERIAL,IMAGE[,PART[,IP]]` command-line form.
    pub fn from_arg(arg: &str) -> Result<Board, ConfError> {
        let parts: Vec<&str> = arg.split(',').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(ConfError::Invalid(format!(
                "expected SERIAL,IMAGE[,PART[,IP]] instead of {arg:?}"
            )));
        }
        let serial = parse_serial(parts[0])
            .map_err(|msg| ConfError::Invalid(format!("board {arg:?}: {msg}")))?;
        let image = PathBuf::from(parts[1]);
        let partition = match parts.get(2) {
            None | Some(&"") => 1,
            Some(p) => p.parse().map_err(|_| {
                ConfError::Invalid(format!("invalid partition number {p:?} in {arg:?}"))
            })?,
        };
        let ip = match parts.get(3) {
            None | Some(&"") => None,
            Some(ip) => Some(ip.parse().map_err(|_| {
                ConfError::Invalid(format!("invalid IP address {ip:?} in {arg:?}"))
            })?),
        };
        Ok(Board {
            serial,
            image,
            partition,
            ip,
        })
    }
}

/// Normalizes a Pi serial number: hex, case-insensitive, with the
/// bootloader's sixteen-digit `10000000`/`00000000` prefix reduced to the
/// trailing eight digits.
pub fn parse_serial(s: &str) -> Result<u32, String> {
    let mut s = s.trim().to_lowercase();
    if s.len() >= 16 && (s.starts_with("10000000") || s.starts_with("00000000")) {
        s = s[8..].to_string();
    }
    let value =
        u64::from_str_radix(&s, 16).map_err(|_| format!("invalid serial number {s:?}"))?;
    u32::try_from(value).map_err(|_| format!("serial number out of range: {s:?}"))
}

/// A port argument: numeric, or a service name looked up in /etc/services.
pub fn parse_port(s: &str) -> Result<u16, String> {
    if let Ok(port) = s.parse() {
        return Ok(port);
    }
    lookup_service(s, Path::new("/etc/services"))
        .ok_or_else(|| format!("invalid service name or port number {s:?}"))
}

fn lookup_service(name: &str, services: &Path) -> Option<u16> {
    let body = std::fs::read_to_string(services).ok()?;
    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let (Some(service), Some(portproto)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((port, proto)) = portproto.split_once('/') else {
            continue;
        };
        if proto != "udp" {
            continue;
        }
        if service == name || fields.any(|alias| alias == name) {
            return port.parse().ok();
        }
    }
    None
}

/// The server's runtime configuration after file and argument merging.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub port: u16,
    pub boards: HashMap<u32, Board>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: "::".to_string(),
            port: 69,
            boards: HashMap::new(),
        }
    }
}

/// The default configuration file search path, in ascending priority.
pub fn default_paths() -> Vec<PathBuf> {
    let xdg = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));
    let mut paths = vec![
        PathBuf::from("/etc/pibootd/pibootd.conf"),
        PathBuf::from("/usr/local/etc/pibootd/pibootd.conf"),
    ];
    if let Some(xdg) = xdg {
        paths.push(xdg.join("pibootd/pibootd.conf"));
    }
    paths
}

impl Config {
    /// Loads configuration from *paths* (missing files are skipped) and
    /// applies the command-line *board_args* on top.
    pub fn load(paths: &[PathBuf], board_args: &[String]) -> Result<Config, ConfError> {
        let mut config = Config::default();
        for path in paths {
            if path.is_file() {
                config.apply_file(path, true)?;
            }
        }
        for arg in board_args {
            let board = Board::from_arg(arg)?;
            config.boards.insert(board.serial, board);
        }
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, allow_include: bool) -> Result<(), ConfError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfError::Io(path.to_path_buf(), e))?;
        let base = path.parent().unwrap_or(Path::new("."));
        for (section, items) in parse_ini(path, &text)? {
            if section == "tftp" {
                for (line, key, value) in items {
                    match key.as_str() {
                        "listen" => self.listen = value,
                        "port" => {
                            self.port = parse_port(&value).map_err(|msg| ConfError::Parse {
                                path: path.to_path_buf(),
                                line,
                                msg,
                            })?
                        }
                        "includedir" if allow_include => {
                            let dir = resolve_relative(base, &value);
                            for included in conf_files(&dir) {
                                self.apply_file(&included, false)?;
                            }
                        }
                        other => {
                            return Err(ConfError::Parse {
                                path: path.to_path_buf(),
                                line,
                                msg: format!("invalid key {other:?} in [tftp]"),
                            })
                        }
                    }
                }
            } else if let Some(serial) = section.strip_prefix("board:") {
                let board = board_from_section(path, base, serial, &items)?;
                self.boards.insert(board.serial, board);
            } else {
                return Err(ConfError::Parse {
                    path: path.to_path_buf(),
                    line: 0,
                    msg: format!("invalid section [{section}]"),
                });
            }
        }
        Ok(())
    }
}

fn resolve_relative(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// `includedir` contents: every *.conf file, lexicographically.
fn conf_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.extension().map_or(false, |e| e == "conf") && p.is_file())
        .collect();
    files.sort();
    files
}

fn board_from_section(
    path: &Path,
    base: &Path,
    serial: &str,
    items: &[(usize, String, String)],
) -> Result<Board, ConfError> {
    let err = |line: usize, msg: String| ConfError::Parse {
        path: path.to_path_buf(),
        line,
        msg,
    };
    let serial = parse_serial(serial).map_err(|msg| err(0, msg))?;
    let mut image = None;
    let mut partition = 1;
    let mut ip = None;
    for (line, key, value) in items {
        match key.as_str() {
            "image" => image = Some(resolve_relative(base, value)),
            "partition" => {
                partition = value
                    .parse()
                    .map_err(|_| err(*line, format!("invalid partition number {value:?}")))?
            }
            "ip" => {
                ip = Some(
                    value
                        .parse()
                        .map_err(|_| err(*line, format!("invalid IP address {value:?}")))?,
                )
            }
            other => {
                return Err(err(
                    *line,
                    format!("invalid key {other:?} in [board:{serial:x}]"),
                ))
            }
        }
    }
    let image = image.ok_or_else(|| err(0, format!("board {serial:x} has no image")))?;
    Ok(Board {
        serial,
        image,
        partition,
        ip,
    })
}

type IniSection = (String, Vec<(usize, String, String)>);

// A deliberately small INI dialect: [section] headers, key = value lines,
// comments with # or ;. Values keep internal whitespace.
fn parse_ini(path: &Path, text: &str) -> Result<Vec<IniSection>, ConfError> {
    let mut sections: Vec<IniSection> = Vec::new();
    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let number = number + 1;
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or_else(|| ConfError::Parse {
                path: path.to_path_buf(),
                line: number,
                msg: "unterminated section header".to_string(),
            })?;
            sections.push((name.trim().to_lowercase(), Vec::new()));
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ConfError::Parse {
            path: path.to_path_buf(),
            line: number,
            msg: format!("expected key = value, got {line:?}"),
        })?;
        let section = sections.last_mut().ok_or_else(|| ConfError::Parse {
            path: path.to_path_buf(),
            line: number,
            msg: "key outside any section".to_string(),
        })?;
        section.1.push((
            number,
            key.trim().to_lowercase(),
            value.trim().to_string(),
        ));
    }
    Ok(sections)
}

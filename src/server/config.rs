//! Line-oriented configuration: static startup parameters, the dynamic
//! route table, the iptables-intent table and the hosts block.
//!
//! One directive per line, `#` starts a comment, leading whitespace is
//! ignored. Static directives (`addr`, `port`, `host`, `mtu`, `bind`,
//! `token`, `expose`) only take effect at first load; dynamic directives
//! (`route`, `iptables`, `hosts`) are rebuilt on every reload and diffed
//! against the previous state.

use anyhow::Context;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_PORT: u16 = 2511;
pub const DEFAULT_MTU: u16 = 1400;

/// Parameters fixed at startup. Reloads parse these lines but never apply
/// them; a process restart is required to change them.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Overlay CIDR carrying the tunnel's own point-to-point pair
    pub addr: Ipv4Net,
    /// UDP listen port
    pub port: u16,
    /// UDP bind address
    pub host: Ipv4Addr,
    /// Chunk size for outbound control payloads
    pub mtu: u16,
    /// Whether a TUN interface is provisioned
    pub bind: bool,
    /// Reserved token bindings, parsed and stored
    pub tokens: HashMap<String, Ipv4Addr>,
    /// Accessor listen address
    pub expose: Option<SocketAddr>,
}

impl StaticConfig {
    /// The far end of the point-to-point pair, taken by the in-VM client
    pub fn peer_ip(&self) -> Ipv4Addr {
        self.addr.addr()
    }

    /// The near end, assigned to the TUN: peer with the last octet bumped
    pub fn local_ip(&self) -> Ipv4Addr {
        let mut octets = self.peer_ip().octets();
        octets[3] = octets[3].wrapping_add(1);
        Ipv4Addr::from(octets)
    }

    /// The overlay network itself, distinct from container subnets
    pub fn subnet(&self) -> Ipv4Net {
        self.addr.trunc()
    }
}

/// A container subnet routed to the TUN on the host side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Marks the subnet as forwardable through the accessor
    pub expose: bool,
}

/// State rebuilt in full on every reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicConfig {
    pub routes: HashMap<Ipv4Net, RouteEntry>,
    /// `A+B` / `A-B` keys; true means connect, false means disconnect.
    /// Kept ordered so control frames encode deterministically.
    pub intents: BTreeMap<String, bool>,
    pub hosts: String,
}

/// Route-set difference between two dynamic states
#[derive(Debug, Default)]
pub struct RouteDelta {
    pub added: Vec<Ipv4Net>,
    pub removed: Vec<Ipv4Net>,
}

impl RouteDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Result of a reload: which host routes to touch, and whether anything
/// dynamic changed at all (routes, intents or hosts)
#[derive(Debug)]
pub struct ReloadOutcome {
    pub delta: RouteDelta,
    pub changed: bool,
}

pub struct ConfigStore {
    path: PathBuf,
    statics: StaticConfig,
    dynamic: RwLock<Arc<DynamicConfig>>,
}

impl ConfigStore {
    /// Load the config file, falling back to the given defaults (built from
    /// the CLI flags) when the file does not exist. Static parse errors are
    /// fatal here and only here.
    pub fn load(path: PathBuf, defaults: StaticConfig) -> crate::Result<ConfigStore> {
        let (statics, dynamic) = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse(&content, &defaults, true)?
        } else {
            tracing::info!("config file {} not found, using flag defaults", path.display());
            (defaults, DynamicConfig::default())
        };
        Ok(ConfigStore {
            path,
            statics,
            dynamic: RwLock::new(Arc::new(dynamic)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn statics(&self) -> &StaticConfig {
        &self.statics
    }

    /// Current dynamic tables. The Arc is swapped wholesale on reload, so a
    /// caller never observes a torn view.
    pub fn snapshot(&self) -> Arc<DynamicConfig> {
        self.dynamic
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reparse the file and swap in the new dynamic tables.
    ///
    /// Malformed lines are logged and skipped; static directives are parsed
    /// but not applied. Returns the route delta against the previous state.
    pub fn reload(&self) -> crate::Result<ReloadOutcome> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let (_, new) = parse(&content, &self.statics, false)?;

        let mut guard = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
        let old = guard.clone();
        let delta = RouteDelta {
            added: new
                .routes
                .keys()
                .filter(|k| !old.routes.contains_key(k))
                .copied()
                .collect(),
            removed: old
                .routes
                .keys()
                .filter(|k| !new.routes.contains_key(k))
                .copied()
                .collect(),
        };
        let changed = *old != new;
        *guard = Arc::new(new);
        Ok(ReloadOutcome { delta, changed })
    }

    /// Append raw bytes pushed by the client to the config file. The watcher
    /// picks the change up like any other edit; there is no other side
    /// effect here.
    pub fn append(&self, payload: &[u8]) -> crate::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(payload)?;
        Ok(())
    }
}

/// Parse the full file. `strict` makes static directive errors fatal (first
/// load); otherwise every malformed line is logged and skipped so partial
/// reloads still apply the valid directives.
fn parse(
    content: &str,
    defaults: &StaticConfig,
    strict: bool,
) -> crate::Result<(StaticConfig, DynamicConfig)> {
    let mut statics = defaults.clone();
    let mut dynamic = DynamicConfig::default();

    for (no, raw) in content.lines().enumerate() {
        let line = raw.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let directive = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        let result = apply_directive(directive, &rest, &mut statics, &mut dynamic);
        if let Err(e) = result {
            if strict && is_static(directive) {
                return Err(format!("line {}: {}", no + 1, e).into());
            }
            tracing::warn!("skipping config line {} ({}): {}", no + 1, directive, e);
        }
    }
    Ok((statics, dynamic))
}

fn is_static(directive: &str) -> bool {
    matches!(
        directive,
        "addr" | "port" | "host" | "mtu" | "bind" | "token" | "expose"
    )
}

fn apply_directive(
    directive: &str,
    args: &[&str],
    statics: &mut StaticConfig,
    dynamic: &mut DynamicConfig,
) -> crate::Result<()> {
    match directive {
        "addr" => {
            statics.addr = arg(args, 0)?.parse().map_err(|_| bad("addr", args))?;
        }
        "port" => {
            statics.port = arg(args, 0)?.parse().map_err(|_| bad("port", args))?;
        }
        "host" => {
            statics.host = arg(args, 0)?.parse().map_err(|_| bad("host", args))?;
        }
        "mtu" => {
            statics.mtu = arg(args, 0)?.parse().map_err(|_| bad("mtu", args))?;
        }
        "bind" => {
            statics.bind = match args.first() {
                None => true,
                Some(v) => v.parse().map_err(|_| bad("bind", args))?,
            };
        }
        "token" => {
            let name = arg(args, 0)?;
            let ip: Ipv4Addr = arg(args, 1)?.parse().map_err(|_| bad("token", args))?;
            statics.tokens.insert(name.to_string(), ip);
        }
        "expose" => {
            statics.expose = Some(arg(args, 0)?.parse().map_err(|_| bad("expose", args))?);
        }
        "route" => {
            let subnet: Ipv4Net = arg(args, 0)?.parse().map_err(|_| bad("route", args))?;
            let expose = match args.get(1) {
                None => false,
                Some(&"expose") => true,
                Some(_) => return Err(bad("route", args)),
            };
            dynamic.routes.insert(subnet.trunc(), RouteEntry { expose });
        }
        "iptables" => {
            let key = arg(args, 0)?;
            let active = intent_active(key).ok_or_else(|| bad("iptables", args))?;
            dynamic.intents.insert(key.to_string(), active);
        }
        "hosts" => {
            // each hosts line appends one entry to the blob
            if !args.is_empty() {
                dynamic.hosts.push_str(&args.join(" "));
                dynamic.hosts.push('\n');
            }
        }
        other => {
            return Err(format!("unknown directive {}", other).into());
        }
    }
    Ok(())
}

/// `A+B` is an active (connect) intent, `A-B` an inactive (disconnect) one.
/// Both sides must be plain IPv4 addresses without a mask.
fn intent_active(key: &str) -> Option<bool> {
    for (sign, active) in [('+', true), ('-', false)] {
        if let Some((a, b)) = key.split_once(sign) {
            if a.parse::<Ipv4Addr>().is_ok() && b.parse::<Ipv4Addr>().is_ok() {
                return Some(active);
            }
            return None;
        }
    }
    None
}

fn arg<'a>(args: &[&'a str], idx: usize) -> crate::Result<&'a str> {
    args.get(idx)
        .copied()
        .ok_or_else(|| format!("missing argument {}", idx + 1).into())
}

fn bad(directive: &str, args: &[&str]) -> crate::Error {
    format!("invalid {} arguments: {:?}", directive, args).into()
}

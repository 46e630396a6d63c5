//! `(( static_ips OFFSET... ))`: hand out fixed IPv4 addresses to the
//! instances of a job from the static ranges of the job's network.
//!
//! The call sits at `jobs.<job>.networks.<binding>.static_ips` (or under
//! `instance_groups`). Addresses come from `networks.<name>.subnets[*].static`
//! and are grouped into per-zone pools by each subnet's `az`/`azs`. Every
//! address handed out is recorded in the run's ledger; a second claim on the
//! same address fails.

use crate::ast::Expr;
use crate::builtins::evaluate;
use crate::error::Error;
use crate::evaluator::{Evaluator, RunState};
use crate::operator::{Operator, Phase, Response};
use crate::path::Path;
use crate::tree::Value;
use indexmap::{IndexMap, IndexSet};
use std::net::Ipv4Addr;
use tracing::debug;

/// Zone assigned to subnets that name none.
pub const DEFAULT_ZONE: &str = "default";

pub struct StaticIps;

impl Operator for StaticIps {
    fn setup(&self, state: &mut RunState) -> Result<(), Error> {
        state.ledger.clear();
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::Eval
    }

    /// The job's instance count and zones, the binding's network name and
    /// anything still to be evaluated in the network declaration.
    fn dependencies(
        &self,
        ev: &Evaluator,
        _args: &[Expr],
        known: &[Path],
        auto: Vec<Path>,
    ) -> Vec<Path> {
        let mut deps = auto;
        let Some(here) = ev.here.as_ref() else {
            return deps;
        };
        let binding = here.parent();
        let mut wanted = vec![binding.child("name")];
        if let Some(job) = job_path(here) {
            wanted.extend(["name", "instances", "azs"].map(|k| job.child(k)));
        }
        let network = binding
            .child("name")
            .resolve(&ev.tree)
            .ok()
            .and_then(Value::scalar_string)
            .map(|name| Path::from_segments(["networks".to_string(), name]))
            .unwrap_or_else(|| Path::from_segments(["networks"]));
        wanted.push(network.clone());

        for path in wanted {
            deps.extend(path.resolvable_ancestor(&ev.tree));
        }
        if let Ok(network) = network.canonical(&ev.tree) {
            deps.extend(known.iter().filter(|k| k.under(&network)).cloned());
        }
        deps
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let here = ev
            .here
            .clone()
            .ok_or_else(|| Error::operator("static_ips: no call site"))?;
        let job = Job::at(&ev.tree, &here)?;
        if job.instances == 0 {
            return Ok(Response::replace(Vec::<Value>::new()));
        }

        let network = network_name(&ev.tree, &here)?;
        let pools = Pools::for_network(&ev.tree, &network)?;
        let zones = pools.select(job.azs.as_deref(), &job.name)?;

        if args.len() < job.instances {
            return Err(Error::operator(format!(
                "static_ips: job {} has {} instance(s) but only {} offset(s) were given",
                job.name,
                job.instances,
                args.len()
            )));
        }

        let mut ips = Vec::with_capacity(job.instances);
        for (i, arg) in args.iter().take(job.instances).enumerate() {
            let offset = Offset::parse(&evaluate(ev, arg)?)?;
            let address = pools.pick(&zones, &offset, &network)?;
            let claimant = format!("{}/{}", job.name, i);
            let address = address.to_string();
            if let Some(existing) = ev.state.ledger.get(&address) {
                return Err(Error::Conflict {
                    address,
                    claimant: existing.clone(),
                    wanted_by: claimant,
                });
            }
            debug!("static_ips: {} -> {}", claimant, address);
            ev.state.ledger.insert(address.clone(), claimant);
            ips.push(Value::String(address));
        }
        Ok(Response::replace(ips))
    }
}

/// Path of the job or instance group enclosing `here`.
fn job_path(here: &Path) -> Option<Path> {
    let segments = here.segments();
    let i = segments
        .iter()
        .rposition(|s| s == "jobs" || s == "instance_groups")?;
    (i + 1 < segments.len()).then(|| Path::from_segments(segments[..=i + 1].iter().cloned()))
}

struct Job {
    name: String,
    instances: usize,
    azs: Option<Vec<String>>,
}

impl Job {
    fn at(tree: &Value, here: &Path) -> Result<Job, Error> {
        let path = job_path(here).ok_or_else(|| {
            Error::operator("static_ips must be used inside a job or instance group")
        })?;
        let job = path.resolve(tree)?;
        let name = job
            .get("name")
            .and_then(Value::scalar_string)
            .or_else(|| path.last().map(str::to_string))
            .unwrap_or_default();

        let instances = match job.get("instances") {
            Some(v) => v
                .as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    Error::operator(format!(
                        "job {}: instances must be a non-negative integer, not `{}`",
                        name, v
                    ))
                })?,
            None => {
                return Err(Error::NotFound {
                    path: path.child("instances").to_string(),
                })
            }
        };

        let azs = match job.get("azs") {
            None | Some(Value::Null) => None,
            Some(Value::Seq(items)) => Some(
                items
                    .iter()
                    .map(|z| {
                        z.scalar_string().ok_or_else(|| {
                            Error::operator(format!("job {}: azs must be a list of names", name))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(_) => {
                return Err(Error::TypeMismatch {
                    path: path.child("azs").to_string(),
                    wanted: "a list",
                    got: "a scalar",
                })
            }
        };

        Ok(Job {
            name,
            instances,
            azs,
        })
    }
}

/// The `name` of the network binding holding the call.
fn network_name(tree: &Value, here: &Path) -> Result<String, Error> {
    let path = here.parent().child("name");
    path.resolve(tree)?
        .scalar_string()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::operator(format!("`{}` is not a network name", path)))
}

/// Static ranges of one network, by zone in declaration order. Addresses
/// are only enumerated up to the offset being picked.
#[derive(Debug, Default)]
struct Pools {
    by_zone: IndexMap<String, Vec<StaticRange>>,
}

impl Pools {
    fn for_network(tree: &Value, network: &str) -> Result<Pools, Error> {
        let path = Path::from_segments(["networks", network]);
        let decl = path.resolve(tree)?;
        let subnets = match decl.get("subnets") {
            Some(Value::Seq(items)) => items,
            Some(other) => {
                return Err(Error::TypeMismatch {
                    path: path.child("subnets").to_string(),
                    wanted: "a list",
                    got: other.kind(),
                })
            }
            None => {
                return Err(Error::NotFound {
                    path: path.child("subnets").to_string(),
                })
            }
        };

        let mut pools = Pools::default();
        for subnet in subnets {
            let mut zones = Vec::new();
            if let Some(az) = subnet.get("az").and_then(Value::scalar_string) {
                zones.push(az);
            }
            if let Some(Value::Seq(azs)) = subnet.get("azs") {
                zones.extend(azs.iter().filter_map(Value::scalar_string));
            }
            if zones.is_empty() {
                zones.push(DEFAULT_ZONE.to_string());
            }

            let ranges: Vec<String> = match subnet.get("static") {
                Some(Value::Seq(items)) => items.iter().filter_map(Value::scalar_string).collect(),
                Some(Value::String(s)) => vec![s.clone()],
                _ => Vec::new(),
            };
            let ranges = ranges
                .iter()
                .map(|r| StaticRange::parse(r))
                .collect::<Result<Vec<_>, _>>()?;
            for zone in zones {
                pools
                    .by_zone
                    .entry(zone)
                    .or_default()
                    .extend(ranges.iter().copied());
            }
        }
        Ok(pools)
    }

    /// Zones the job draws from: its own list, checked against the pools,
    /// or every pool zone.
    fn select(&self, azs: Option<&[String]>, job: &str) -> Result<Vec<String>, Error> {
        match azs {
            Some(azs) => {
                for az in azs {
                    if !self.by_zone.contains_key(az) {
                        return Err(Error::operator(format!(
                            "job {}: availability zone {} has no static addresses on this network",
                            job, az
                        )));
                    }
                }
                Ok(azs.to_vec())
            }
            None => Ok(self.by_zone.keys().cloned().collect()),
        }
    }

    fn pick(&self, zones: &[String], offset: &Offset, network: &str) -> Result<Ipv4Addr, Error> {
        match offset {
            Offset::Any(n) => {
                // Zones may share subnets, so the combined pool is deduplicated.
                let mut seen = IndexSet::new();
                let addresses = zones
                    .iter()
                    .filter_map(|z| self.by_zone.get(z))
                    .flatten()
                    .flat_map(StaticRange::iter);
                for address in addresses {
                    seen.insert(address);
                    if seen.len() > *n {
                        return Ok(address);
                    }
                }
                Err(Error::operator(format!(
                    "static_ips: offset {} is out of range; network {} has {} static address(es)",
                    n,
                    network,
                    seen.len()
                )))
            }
            Offset::InZone(zone, n) => {
                if !zones.contains(zone) {
                    return Err(Error::operator(format!(
                        "static_ips: availability zone {} is not one of this job's zones",
                        zone
                    )));
                }
                let pool = self.by_zone.get(zone).map(Vec::as_slice).unwrap_or(&[]);
                let mut rest = *n as u64;
                for range in pool {
                    match range.get(rest) {
                        Some(address) => return Ok(address),
                        None => rest -= range.size(),
                    }
                }
                Err(Error::operator(format!(
                    "static_ips: offset {} is out of range; zone {} of network {} has {} static address(es)",
                    n,
                    zone,
                    network,
                    pool.iter().map(StaticRange::size).sum::<u64>()
                )))
            }
        }
    }
}

/// One static_ips argument: `N` or `"zone:N"`.
#[derive(Debug, Clone, PartialEq)]
enum Offset {
    Any(usize),
    InZone(String, usize),
}

impl Offset {
    fn parse(value: &Value) -> Result<Offset, Error> {
        let text = value
            .scalar_string()
            .ok_or_else(|| Error::operator(format!("static_ips: invalid offset {}", value)))?;
        let index = |s: &str| {
            s.trim().parse::<usize>().map_err(|_| {
                Error::operator(format!(
                    "static_ips: `{}` is not a non-negative integer offset",
                    text
                ))
            })
        };
        match text.split_once(':') {
            Some((zone, n)) => Ok(Offset::InZone(zone.trim().to_string(), index(n)?)),
            None => Ok(Offset::Any(index(&text)?)),
        }
    }
}

/// An inclusive run of IPv4 addresses: `A - B` or a single address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticRange {
    start: u32,
    end: u32,
}

impl StaticRange {
    pub fn parse(range: &str) -> Result<StaticRange, Error> {
        let parse = |s: &str| -> Result<u32, Error> {
            let address: Ipv4Addr = s.trim().parse().map_err(|_| {
                Error::operator(format!(
                    "static range `{}`: `{}` is not a valid IPv4 address",
                    range,
                    s.trim()
                ))
            })?;
            Ok(u32::from(address))
        };
        let parts: Vec<&str> = range.split('-').collect();
        match parts.as_slice() {
            [single] => {
                let address = parse(*single)?;
                Ok(StaticRange {
                    start: address,
                    end: address,
                })
            }
            [start, end] => {
                let (start, end) = (parse(*start)?, parse(*end)?);
                if end < start {
                    return Err(Error::operator(format!(
                        "static range `{}` ends before it starts",
                        range
                    )));
                }
                Ok(StaticRange { start, end })
            }
            _ => Err(Error::operator(format!(
                "static range `{}` is not an address or an `A - B` range",
                range
            ))),
        }
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    /// The `n`th address of the range, counting from zero.
    pub fn get(&self, n: u64) -> Option<Ipv4Addr> {
        u32::try_from(n)
            .ok()
            .and_then(|n| self.start.checked_add(n))
            .filter(|address| *address <= self.end)
            .map(Ipv4Addr::from)
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }
}

/// Expand `A - B` (inclusive) or a single address into a list.
pub fn expand_range(range: &str) -> Result<Vec<Ipv4Addr>, Error> {
    StaticRange::parse(range).map(|r| r.iter().collect())
}

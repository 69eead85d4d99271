// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Closed loops of baselines.
//!
//! Closure phases are formed on triangles of stations and closure amplitudes
//! on quadrangles. Loops only ever join visibilities measured at the same
//! time. The groupings are made once per observation and then reused by
//! every data term and every optimiser iteration.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use super::FilteredObservation;
use crate::ImagerError;

/// Which closed loops to form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureSelection {
    /// Every loop that can be formed.
    #[default]
    All,

    /// Only loops that pass through the first (alphabetical) station present
    /// at each time. This removes most of the redundancy between loops.
    ReferenceStation,
}

/// One baseline of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    /// The index of the visibility in the [`FilteredObservation`].
    pub index: usize,

    /// Whether the visibility is measured in the opposite direction to the
    /// loop, and so needs to be conjugated.
    pub conjugate: bool,
}

/// Three baselines a->b, b->c, c->a. The product of their visibilities is the
/// bispectrum and its phase is the closure phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triangle {
    pub legs: [Leg; 3],
}

/// Four baselines on four stations. The closure amplitude is
/// |V0| |V1| / (|V2| |V3|).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quadrangle {
    pub indices: [usize; 4],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosureSet {
    pub triangles: Vec<Triangle>,
    pub quadrangles: Vec<Quadrangle>,
}

impl ClosureSet {
    /// Find all closed loops in the observation.
    pub fn new(obs: &FilteredObservation, selection: ClosureSelection) -> ClosureSet {
        let mut triangles = vec![];
        let mut quadrangles = vec![];

        for (_, indices) in group_by_time(obs) {
            let stations: Vec<&str> = indices
                .iter()
                .flat_map(|&i| {
                    let vis = &obs.visibilities[i];
                    [vis.station1.as_str(), vis.station2.as_str()]
                })
                .sorted()
                .dedup()
                .collect();
            let station_id = |name| stations.binary_search(&name).ok();

            // The visibility on each (ordered) station pair at this time.
            let mut baselines: HashMap<(usize, usize), usize> = HashMap::new();
            for &i in &indices {
                let vis = &obs.visibilities[i];
                if let (Some(s1), Some(s2)) = (
                    station_id(vis.station1.as_str()),
                    station_id(vis.station2.as_str()),
                ) {
                    if s1 != s2 {
                        baselines.entry((s1, s2)).or_insert(i);
                    }
                }
            }
            let leg = |a: usize, b: usize| -> Option<Leg> {
                baselines
                    .get(&(a, b))
                    .map(|&index| Leg {
                        index,
                        conjugate: false,
                    })
                    .or_else(|| {
                        baselines.get(&(b, a)).map(|&index| Leg {
                            index,
                            conjugate: true,
                        })
                    })
            };

            // Station 0 is the alphabetically-first station at this time.
            let wanted = |first: usize| match selection {
                ClosureSelection::All => true,
                ClosureSelection::ReferenceStation => first == 0,
            };

            for (a, b, c) in (0..stations.len()).tuple_combinations() {
                if !wanted(a) {
                    continue;
                }
                if let (Some(ab), Some(bc), Some(ca)) = (leg(a, b), leg(b, c), leg(c, a)) {
                    triangles.push(Triangle {
                        legs: [ab, bc, ca],
                    });
                }
            }

            for (a, b, c, d) in (0..stations.len()).tuple_combinations() {
                if !wanted(a) {
                    continue;
                }
                let (ab, cd, ac, bd, ad, bc) = match (
                    leg(a, b),
                    leg(c, d),
                    leg(a, c),
                    leg(b, d),
                    leg(a, d),
                    leg(b, c),
                ) {
                    (Some(ab), Some(cd), Some(ac), Some(bd), Some(ad), Some(bc)) => {
                        (ab, cd, ac, bd, ad, bc)
                    }
                    _ => continue,
                };
                // Two independent closure amplitudes per quadrangle.
                quadrangles.push(Quadrangle {
                    indices: [ab.index, cd.index, ac.index, bd.index],
                });
                quadrangles.push(Quadrangle {
                    indices: [ad.index, bc.index, ac.index, bd.index],
                });
            }
        }

        debug!(
            "Formed {} closure triangles and {} closure quadrangles",
            triangles.len(),
            quadrangles.len()
        );
        ClosureSet {
            triangles,
            quadrangles,
        }
    }

    /// Use loops that were chosen elsewhere. Each triangle is three visibility
    /// indices that must form a closed loop on three stations; each quadrangle
    /// is four indices where the first two and the last two baselines each
    /// cover all four stations.
    pub fn from_groups(
        obs: &FilteredObservation,
        triangles: &[[usize; 3]],
        quadrangles: &[[usize; 4]],
    ) -> Result<ClosureSet, ImagerError> {
        let check_indices = |indices: &[usize]| -> Result<(), ImagerError> {
            if let Some(&bad) = indices.iter().find(|&&i| i >= obs.len()) {
                return Err(ImagerError::InvalidObservation(format!(
                    "closure group {indices:?} refers to visibility {bad}, but there are only {}",
                    obs.len()
                )));
            }
            let time = obs.visibilities[indices[0]].time;
            if indices.iter().any(|&i| obs.visibilities[i].time != time) {
                return Err(ImagerError::InvalidObservation(format!(
                    "closure group {indices:?} mixes visibilities from different times"
                )));
            }
            Ok(())
        };
        let stations = |i: usize| {
            let vis = &obs.visibilities[i];
            (vis.station1.as_str(), vis.station2.as_str())
        };

        let mut set = ClosureSet::default();
        for tri in triangles {
            check_indices(&tri[..])?;
            let not_closed = || {
                ImagerError::InvalidObservation(format!(
                    "visibilities {tri:?} don't form a closed triangle"
                ))
            };

            // Walk a -> b -> c -> a.
            let (a, b) = stations(tri[0]);
            let (c, conj1) = match stations(tri[1]) {
                (s1, s2) if s1 == b && s2 != a => (s2, false),
                (s1, s2) if s2 == b && s1 != a => (s1, true),
                _ => return Err(not_closed()),
            };
            let conj2 = match stations(tri[2]) {
                (s1, s2) if s1 == c && s2 == a => false,
                (s1, s2) if s1 == a && s2 == c => true,
                _ => return Err(not_closed()),
            };
            if a == b || b == c {
                return Err(not_closed());
            }
            set.triangles.push(Triangle {
                legs: [
                    Leg {
                        index: tri[0],
                        conjugate: false,
                    },
                    Leg {
                        index: tri[1],
                        conjugate: conj1,
                    },
                    Leg {
                        index: tri[2],
                        conjugate: conj2,
                    },
                ],
            });
        }

        for quad in quadrangles {
            check_indices(&quad[..])?;
            let covers_four = |i: usize, j: usize| {
                let (a, b) = stations(i);
                let (c, d) = stations(j);
                [a, b, c, d].iter().sorted().dedup().count() == 4
            };
            let same_stations = {
                let all = |idx: [usize; 2]| {
                    idx.iter()
                        .flat_map(|&i| {
                            let (a, b) = stations(i);
                            [a, b]
                        })
                        .sorted()
                        .collect::<Vec<_>>()
                };
                all([quad[0], quad[1]]) == all([quad[2], quad[3]])
            };
            let same_pairing = {
                let pair = |i: usize| {
                    let (a, b) = stations(i);
                    if a < b {
                        (a, b)
                    } else {
                        (b, a)
                    }
                };
                let mut top = [pair(quad[0]), pair(quad[1])];
                let mut bot = [pair(quad[2]), pair(quad[3])];
                top.sort();
                bot.sort();
                top == bot
            };
            if !covers_four(quad[0], quad[1])
                || !covers_four(quad[2], quad[3])
                || !same_stations
                || same_pairing
            {
                return Err(ImagerError::InvalidObservation(format!(
                    "visibilities {quad:?} don't form a closure quadrangle"
                )));
            }
            set.quadrangles.push(Quadrangle { indices: *quad });
        }

        Ok(set)
    }
}

/// Indices of visibilities grouped by timestamp, in time order.
fn group_by_time(obs: &FilteredObservation) -> BTreeMap<i64, Vec<usize>> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, vis) in obs.visibilities.iter().enumerate() {
        // Nanosecond resolution is far finer than any VLBI integration.
        let key = (vis.time.to_gpst_seconds() * 1e9).round() as i64;
        groups.entry(key).or_default().push(i);
    }
    groups
}

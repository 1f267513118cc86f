//!
//! Reference boards: marker ids mapped to their 3D corners on a planar target
//!
//! Boards are stored in a whitespace-separated text format:
//!
//! ```text
//! <units> <marker count> (<id> 4 <x0> <y0> <z0> ... <x3> <y3> <z3>)* <name>
//! ```
//!
//! where `units` is `-1` (unknown), `0` (pixels) or `1` (meters).
//!

use markercal_core::prelude::*;
use nalgebra::{Point3, Vector3};
use snafu::prelude::*;
use std::{collections::HashMap, fmt, fs, path::Path, str::FromStr};

/// Relative tolerance used for the planarity checks
const PLANAR_TOL: f64 = 1e-6;

/// Built-in A4 board: 24 markers of 500 units on a 4x6 grid
#[rustfmt::skip]
pub const DEFAULT_BOARD: &str = "0 24 \
    161 4 -1000 -1000 0 -500 -1000 0 -500 -1500 0 -1000 -1500 0 \
    227 4 -400 -1000 0 100 -1000 0 100 -1500 0 -400 -1500 0 \
    85 4 200 -1000 0 700 -1000 0 700 -1500 0 200 -1500 0 \
    166 4 800 -1000 0 1300 -1000 0 1300 -1500 0 800 -1500 0 \
    244 4 -1000 -400 0 -500 -400 0 -500 -900 0 -1000 -900 0 \
    144 4 -400 -400 0 100 -400 0 100 -900 0 -400 -900 0 \
    90 4 200 -400 0 700 -400 0 700 -900 0 200 -900 0 \
    214 4 800 -400 0 1300 -400 0 1300 -900 0 800 -900 0 \
    153 4 -1000 200 0 -500 200 0 -500 -300 0 -1000 -300 0 \
    7 4 -400 200 0 100 200 0 100 -300 0 -400 -300 0 \
    143 4 200 200 0 700 200 0 700 -300 0 200 -300 0 \
    219 4 800 200 0 1300 200 0 1300 -300 0 800 -300 0 \
    78 4 -1000 800 0 -500 800 0 -500 300 0 -1000 300 0 \
    159 4 -400 800 0 100 800 0 100 300 0 -400 300 0 \
    209 4 200 800 0 700 800 0 700 300 0 200 300 0 \
    13 4 800 800 0 1300 800 0 1300 300 0 800 300 0 \
    247 4 -1000 1400 0 -500 1400 0 -500 900 0 -1000 900 0 \
    237 4 -400 1400 0 100 1400 0 100 900 0 -400 900 0 \
    100 4 200 1400 0 700 1400 0 700 900 0 200 900 0 \
    6 4 800 1400 0 1300 1400 0 1300 900 0 800 900 0 \
    177 4 -1000 2000 0 -500 2000 0 -500 1500 0 -1000 1500 0 \
    93 4 -400 2000 0 100 2000 0 100 1500 0 -400 1500 0 \
    86 4 200 2000 0 700 2000 0 700 1500 0 200 1500 0 \
    229 4 800 2000 0 1300 2000 0 1300 1500 0 800 1500 0 \
    ARUCO_MIP_36h12";

/// Units the board coordinates are expressed in
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardUnits {
    #[default]
    Unknown,
    Pixels,
    Meters,
}
impl BoardUnits {
    const fn code(self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Pixels => 0,
            Self::Meters => 1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Unknown),
            0 => Some(Self::Pixels),
            1 => Some(Self::Meters),
            _ => None,
        }
    }
}

/// A single marker of a board
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMarker {
    pub id: u32,
    /// Corners in detection order
    pub corners: [Point3<f64>; 4],
}
impl ReferenceMarker {
    /// Length of the first edge
    pub fn edge_length(&self) -> f64 {
        (self.corners[1] - self.corners[0]).norm()
    }

    /// Area-weighted normal (Newell's method); its direction encodes the winding
    fn normal(&self) -> Vector3<f64> {
        let mut n = Vector3::zeros();
        for i in 0..4 {
            let a = self.corners[i];
            let b = self.corners[(i + 1) % 4];
            n.x += (a.y - b.y) * (a.z + b.z);
            n.y += (a.z - b.z) * (a.x + b.x);
            n.z += (a.x - b.x) * (a.y + b.y);
        }

        n
    }
}

/// A planar calibration target
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceBoard {
    units: BoardUnits,
    markers: Vec<ReferenceMarker>,
    name: String,
    index: HashMap<u32, usize>,
}
impl ReferenceBoard {
    /// Build and validate a board
    pub fn new(
        units: BoardUnits,
        markers: Vec<ReferenceMarker>,
        name: impl Into<String>,
    ) -> Result<Self, Error> {
        let mut index = HashMap::with_capacity(markers.len());
        for (i, marker) in markers.iter().enumerate() {
            ensure!(
                index.insert(marker.id, i).is_none(),
                DuplicateMarkerSnafu { id: marker.id }
            );
        }

        let board = Self {
            units,
            markers,
            name: name.into(),
            index,
        };
        board.validate()?;

        Ok(board)
    }

    /// Decode the built-in board
    pub fn decode_default() -> Self {
        DEFAULT_BOARD
            .parse()
            .expect("the built-in board is well formed")
    }

    /// Load a board from a file in the text format
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).context(FailedToReadBoardSnafu { path })?;
        let board: Self = buf.parse()?;
        debug!(
            "loaded board '{}' with {} markers from {}",
            board.name,
            board.len(),
            path.display()
        );

        Ok(board)
    }

    pub fn lookup(&self, id: u32) -> Option<&ReferenceMarker> {
        self.index.get(&id).map(|&i| &self.markers[i])
    }

    pub fn markers(&self) -> &[ReferenceMarker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn units(&self) -> BoardUnits {
        self.units
    }

    pub fn is_metric(&self) -> bool {
        self.units == BoardUnits::Meters
    }

    /// Convert the board to meters, given the physical edge length of a marker
    ///
    /// The native edge length is taken from the first edge of the first marker. Boards
    /// already in meters are returned as they are.
    pub fn convert_to_metric(&self, edge_length: f64) -> Result<Self, Error> {
        ensure!(
            edge_length.is_finite() && edge_length > 0.0,
            InvalidMarkerSizeSnafu { size: edge_length }
        );
        if self.is_metric() {
            return Ok(self.clone());
        }

        let native = self.markers.first().map_or(0.0, ReferenceMarker::edge_length);
        ensure!(
            native > f64::EPSILON,
            InvalidBoardSnafu {
                reason: "first marker has a zero-length edge",
            }
        );

        let factor = edge_length / native;
        let markers = self
            .markers
            .iter()
            .map(|m| ReferenceMarker {
                id: m.id,
                corners: m.corners.map(|c| Point3::from(c.coords * factor)),
            })
            .collect();

        Ok(Self {
            units: BoardUnits::Meters,
            markers,
            name: self.name.clone(),
            index: self.index.clone(),
        })
    }

    /// Check the geometric consistency of the board
    ///
    /// Every marker must be a non-degenerate planar quad, all markers must lie on one
    /// plane and share the same corner winding.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            !self.markers.is_empty(),
            InvalidBoardSnafu {
                reason: "board has no markers",
            }
        );

        let mut reference_normal: Option<Vector3<f64>> = None;
        for marker in &self.markers {
            let id = marker.id;
            ensure!(
                marker.corners.iter().all(|c| c.coords.iter().all(|v| v.is_finite())),
                InvalidBoardSnafu {
                    reason: format!("marker {id} has non-finite corners"),
                }
            );

            let normal = marker.normal();
            let scale = marker.edge_length();
            ensure!(
                scale > f64::EPSILON && normal.norm() > PLANAR_TOL * scale * scale,
                InvalidBoardSnafu {
                    reason: format!("marker {id} is degenerate"),
                }
            );

            let unit = normal.normalize();
            let off_plane = marker
                .corners
                .iter()
                .map(|c| (c - marker.corners[0]).dot(&unit).abs())
                .fold(0.0, f64::max);
            ensure!(
                off_plane <= PLANAR_TOL * scale,
                InvalidBoardSnafu {
                    reason: format!("marker {id} corners are not coplanar"),
                }
            );

            match reference_normal {
                None => reference_normal = Some(unit),
                Some(n) => {
                    ensure!(
                        n.dot(&unit) > 0.0,
                        InvalidBoardSnafu {
                            reason: format!("marker {id} has the opposite winding"),
                        }
                    );
                    let off_board = marker
                        .corners
                        .iter()
                        .map(|c| (c - self.markers[0].corners[0]).dot(&n).abs())
                        .fold(0.0, f64::max);
                    ensure!(
                        off_board <= PLANAR_TOL * self.extent().max(scale),
                        InvalidBoardSnafu {
                            reason: format!("marker {id} is off the board plane"),
                        }
                    );
                }
            }
        }

        Ok(())
    }

    /// Largest distance between any corner and the first corner of the board
    fn extent(&self) -> f64 {
        let origin = self.markers[0].corners[0];
        self.markers
            .iter()
            .flat_map(|m| m.corners.iter())
            .map(|c| (c - origin).norm())
            .fold(0.0, f64::max)
    }
}
impl Default for ReferenceBoard {
    fn default() -> Self {
        Self::decode_default()
    }
}

impl FromStr for ReferenceBoard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn invalid(reason: impl Into<String>) -> Error {
            Error::InvalidBoard {
                reason: reason.into(),
            }
        }
        fn next<'a, T: FromStr>(
            tokens: &mut impl Iterator<Item = &'a str>,
            what: &str,
        ) -> Result<T, Error> {
            let token = tokens
                .next()
                .ok_or_else(|| invalid(format!("unexpected end of input, expected {what}")))?;
            token
                .parse()
                .map_err(|_| invalid(format!("expected {what}, found '{token}'")))
        }

        let mut tokens = s.split_whitespace();

        let code: i32 = next(&mut tokens, "unit code")?;
        let units =
            BoardUnits::from_code(code).ok_or_else(|| invalid(format!("unknown unit code {code}")))?;
        let count: usize = next(&mut tokens, "marker count")?;

        let mut markers = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let id: u32 = next(&mut tokens, "marker id")?;
            let n_corners: usize = next(&mut tokens, "corner count")?;
            ensure!(
                n_corners == 4,
                InvalidBoardSnafu {
                    reason: format!("marker {id} has {n_corners} corners"),
                }
            );

            let mut corners = [Point3::origin(); 4];
            for corner in &mut corners {
                *corner = Point3::new(
                    next(&mut tokens, "coordinate")?,
                    next(&mut tokens, "coordinate")?,
                    next(&mut tokens, "coordinate")?,
                );
            }
            markers.push(ReferenceMarker { id, corners });
        }

        let name = tokens.next().unwrap_or_default().to_owned();
        if let Some(extra) = tokens.next() {
            return Err(invalid(format!("trailing data after board name: '{extra}'")));
        }

        Self::new(units, markers, name)
    }
}

impl fmt::Display for ReferenceBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.units.code(), self.markers.len())?;
        for marker in &self.markers {
            write!(f, " {} 4", marker.id)?;
            for c in &marker.corners {
                write!(f, " {} {} {}", c.x, c.y, c.z)?;
            }
        }
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }

        Ok(())
    }
}

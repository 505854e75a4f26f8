//! Annotation primitives drawn on top of a page.
//!
//! Items carry no identity of their own. Two items are "the same item" when
//! their geometry matches, which is what delete-by-coordinates relies on
//! both locally and on the server.

use serde::{Deserialize, Serialize};

/// RGBA colour, one byte per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

/// A point in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Point {
    /// Neither coordinate is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// What an item's coordinates describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Freehand polyline.
    Stroke,
    /// Axis-aligned rectangle given by two opposite corners.
    Rect,
    /// Circle given by its centre and one point on the rim.
    Circle,
}

/// A single annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    /// Structural geometry; doubles as the item's key.
    pub coords: Vec<Point>,
    pub color: Color,
    /// Fill colour for shapes. Strokes are never filled.
    pub fill: Option<Color>,
    pub width: f64,
}

impl Item {
    pub const DEFAULT_WIDTH: f64 = 1.5;

    /// Create a stroke through the given points.
    pub fn stroke(points: impl IntoIterator<Item = Point>) -> Self {
        Self {
            kind: ItemKind::Stroke,
            coords: points.into_iter().collect(),
            color: Color::default(),
            fill: None,
            width: Self::DEFAULT_WIDTH,
        }
    }

    /// Create a rectangle from two opposite corners.
    pub fn rect(from: Point, to: Point) -> Self {
        Self {
            kind: ItemKind::Rect,
            coords: vec![from, to],
            color: Color::default(),
            fill: None,
            width: Self::DEFAULT_WIDTH,
        }
    }

    /// Create a circle from its centre and a point on its rim.
    pub fn circle(center: Point, rim: Point) -> Self {
        Self {
            kind: ItemKind::Circle,
            coords: vec![center, rim],
            color: Color::default(),
            fill: None,
            width: Self::DEFAULT_WIDTH,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// Set the fill colour. Ignored for strokes.
    pub fn with_fill(mut self, fill: Color) -> Self {
        if self.kind != ItemKind::Stroke {
            self.fill = Some(fill);
        }
        self
    }

    pub fn with_width(mut self, width: f64) -> Self {
        self.width = width;
        self
    }

    /// Whether this item's geometry equals `coords`.
    pub fn matches(&self, coords: &[Point]) -> bool {
        self.coords == coords
    }

    /// Whether every coordinate and the width are finite numbers.
    ///
    /// JSON has no NaN or infinity, so only finite items can be stored.
    pub fn is_finite(&self) -> bool {
        self.width.is_finite() && self.coords.iter().all(Point::is_finite)
    }

    /// Radius of a circle item, `None` for other kinds.
    pub fn radius(&self) -> Option<f64> {
        match (self.kind, self.coords.as_slice()) {
            (ItemKind::Circle, [c, rim]) => Some((rim.x - c.x).hypot(rim.y - c.y)),
            _ => None,
        }
    }
}

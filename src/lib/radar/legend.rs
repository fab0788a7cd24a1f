use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::BYTE_LOOKUP_LENGTH;

const TRANSPARENT: u8 = 0;
const OPAQUE: u8 = 255;

#[derive(
    clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ColorScheme {
    #[default]
    Day,
    Dusk,
    Night,
}

/// Intensity boundaries between the weak, medium, strong and very strong tiers.
/// A pixel belongs to the first tier whose threshold it is below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub weak: u8,
    pub medium: u8,
    pub strong: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            weak: 50,
            medium: 100,
            strong: 200,
        }
    }
}

impl Thresholds {
    pub fn new(weak: u8, medium: u8, strong: u8) -> Self {
        Thresholds {
            weak,
            medium,
            strong,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Tier {
    None,
    Weak,
    Medium,
    Strong,
    VeryStrong,
}

impl Tier {
    pub fn of(intensity: u8, thresholds: &Thresholds) -> Tier {
        if intensity == 0 {
            Tier::None
        } else if intensity < thresholds.weak {
            Tier::Weak
        } else if intensity < thresholds.medium {
            Tier::Medium
        } else if intensity < thresholds.strong {
            Tier::Strong
        } else {
            Tier::VeryStrong
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color { r, g, b, a }
    }

    pub fn to_rgba(&self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{:02x}{:02x}{:02x}{:02x}",
            self.r, self.g, self.b, self.a
        )
    }
}

impl Serialize for Color {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

fn tier_color(scheme: ColorScheme, tier: Tier) -> Color {
    match (tier, scheme) {
        // No return is see-through in every scheme
        (Tier::None, _) => Color::new(0, 0, 0, TRANSPARENT),

        (Tier::Weak, ColorScheme::Day) => Color::new(0, 100, 0, 128),
        (Tier::Weak, ColorScheme::Dusk) => Color::new(0, 50, 100, 128),
        (Tier::Weak, ColorScheme::Night) => Color::new(0, 50, 80, 128),

        (Tier::Medium, ColorScheme::Day) => Color::new(0, 200, 0, 180),
        (Tier::Medium, ColorScheme::Dusk) => Color::new(0, 150, 150, 180),
        (Tier::Medium, ColorScheme::Night) => Color::new(0, 100, 150, 180),

        (Tier::Strong, ColorScheme::Day) => Color::new(200, 200, 0, 220),
        (Tier::Strong, ColorScheme::Dusk) => Color::new(150, 200, 50, 220),
        (Tier::Strong, ColorScheme::Night) => Color::new(100, 200, 200, 220),

        (Tier::VeryStrong, ColorScheme::Day) => Color::new(255, 100, 0, OPAQUE),
        (Tier::VeryStrong, ColorScheme::Dusk) => Color::new(255, 255, 100, OPAQUE),
        (Tier::VeryStrong, ColorScheme::Night) => Color::new(200, 255, 255, OPAQUE),
    }
}

///
/// Maps every possible pixel intensity to an RGBA color. This is what a
/// renderer uploads next to the sweep texture.
///
#[derive(Clone, Debug)]
pub struct ColorLookup {
    scheme: ColorScheme,
    thresholds: Thresholds,
    pixels: [Color; BYTE_LOOKUP_LENGTH],
}

impl Default for ColorLookup {
    fn default() -> Self {
        ColorLookup::build(ColorScheme::default(), Thresholds::default())
    }
}

impl ColorLookup {
    pub fn build(scheme: ColorScheme, thresholds: Thresholds) -> Self {
        let mut lookup = ColorLookup {
            scheme,
            thresholds,
            pixels: [Color::default(); BYTE_LOOKUP_LENGTH],
        };
        lookup.rebuild();
        lookup
    }

    fn rebuild(&mut self) {
        for (intensity, pixel) in self.pixels.iter_mut().enumerate() {
            *pixel = tier_color(self.scheme, Tier::of(intensity as u8, &self.thresholds));
        }
        log::debug!(
            "Built {:?} color lookup with thresholds {:?}",
            self.scheme,
            self.thresholds
        );
    }

    pub fn scheme(&self) -> ColorScheme {
        self.scheme
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn set_scheme(&mut self, scheme: ColorScheme) {
        if scheme != self.scheme {
            self.scheme = scheme;
            self.rebuild();
        }
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        if thresholds != self.thresholds {
            self.thresholds = thresholds;
            self.rebuild();
        }
    }

    #[inline]
    pub fn lookup(&self, intensity: u8) -> Color {
        self.pixels[intensity as usize]
    }

    /// The table as 256 x RGBA bytes, the layout a shader expects.
    pub fn to_rgba_table(&self) -> [u8; BYTE_LOOKUP_LENGTH * 4] {
        let mut table = [0u8; BYTE_LOOKUP_LENGTH * 4];
        for (chunk, color) in table.chunks_exact_mut(4).zip(self.pixels.iter()) {
            chunk.copy_from_slice(&color.to_rgba());
        }
        table
    }

    /// Convert a row of intensities into RGBA pixels, appended to `rgba`.
    pub fn colorize(&self, intensities: &[u8], rgba: &mut Vec<u8>) {
        rgba.reserve(intensities.len() * 4);
        for intensity in intensities {
            rgba.extend_from_slice(&self.lookup(*intensity).to_rgba());
        }
    }
}

impl Serialize for ColorLookup {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_map(Some(self.pixels.len()))?;
        for (n, value) in self.pixels.iter().enumerate() {
            let key = n.to_string();
            state.serialize_entry(&key, value)?;
        }
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMES: [ColorScheme; 3] = [ColorScheme::Day, ColorScheme::Dusk, ColorScheme::Night];

    #[test]
    fn zero_is_transparent_in_every_scheme() {
        for scheme in SCHEMES {
            let lut = ColorLookup::build(scheme, Thresholds::default());
            assert_eq!(lut.lookup(0).a, 0, "scheme {:?}", scheme);
        }
        // Even when the weak threshold would include zero
        let lut = ColorLookup::build(ColorScheme::Night, Thresholds::new(0, 0, 0));
        assert_eq!(lut.lookup(0).a, 0);
        assert_eq!(lut.lookup(1), Color::new(200, 255, 255, 255));
    }

    #[test]
    fn day_tiers() {
        let lut = ColorLookup::build(ColorScheme::Day, Thresholds::new(50, 100, 200));

        assert_eq!(lut.lookup(0).a, 0);
        assert_eq!(lut.lookup(1), Color::new(0, 100, 0, 128));
        assert_eq!(lut.lookup(49), Color::new(0, 100, 0, 128));
        assert_eq!(lut.lookup(50), Color::new(0, 200, 0, 180));
        assert_eq!(lut.lookup(199), Color::new(200, 200, 0, 220));
        assert_eq!(lut.lookup(200), Color::new(255, 100, 0, 255));
        assert_eq!(lut.lookup(201), Color::new(255, 100, 0, 255));
        assert_eq!(lut.lookup(255), Color::new(255, 100, 0, 255));
    }

    #[test]
    fn rebuild_on_change() {
        let mut lut = ColorLookup::default();
        assert_eq!(lut.lookup(120), Color::new(200, 200, 0, 220));

        lut.set_scheme(ColorScheme::Dusk);
        assert_eq!(lut.scheme(), ColorScheme::Dusk);
        assert_eq!(lut.lookup(120), Color::new(150, 200, 50, 220));

        lut.set_thresholds(Thresholds::new(10, 20, 30));
        assert_eq!(lut.lookup(120), Color::new(255, 255, 100, 255));
        assert_eq!(lut.lookup(15), Color::new(0, 150, 150, 180));
    }

    #[test]
    fn rgba_table_layout() {
        let lut = ColorLookup::build(ColorScheme::Night, Thresholds::default());
        let table = lut.to_rgba_table();

        assert_eq!(&table[0..4], &[0, 0, 0, 0]);
        assert_eq!(&table[4..8], &[0, 50, 80, 128]);
        assert_eq!(&table[255 * 4..], &[200, 255, 255, 255]);
    }

    #[test]
    fn legend_serializes_as_hex_colors() {
        let lut = ColorLookup::default();
        let json = serde_json::to_value(&lut).unwrap();

        assert_eq!(json["0"], "#00000000");
        assert_eq!(json["255"], "#ff6400ff");
        assert_eq!(json.as_object().unwrap().len(), 256);
    }
}

use courtwatch_types::{slot::TimeRange, Result};

use crate::{site_error, RawSlot};

/// The two visual cues the booking page puts on a taken slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusMarkers {
    /// Rendered in the "blocked" colour (red).
    pub blocked: bool,
    /// Pointer interaction disabled (`cursor: not-allowed`).
    pub not_interactive: bool,
}

impl StatusMarkers {
    pub const fn new(blocked: bool, not_interactive: bool) -> Self {
        Self {
            blocked,
            not_interactive,
        }
    }

    /// Reads the markers out of an inline `style` attribute.
    pub fn from_style(style: &str) -> Self {
        let mut markers = Self::default();
        for declaration in style.split(';') {
            let Some((property, value)) = declaration.split_once(':') else {
                continue;
            };
            let property = property.trim().to_ascii_lowercase();
            let value = value.trim().to_ascii_lowercase();
            match property.as_str() {
                "color" if value == "red" || value == "#f00" || value == "#ff0000" => {
                    markers.blocked = true
                }
                "cursor" if value == "not-allowed" => markers.not_interactive = true,
                _ => {}
            }
        }
        markers
    }

    /// The calendar API folds both cues into one flag: `0` means taken.
    /// Anything other than a literal `0` leaves both cues unset.
    pub fn from_flag(flag: &str) -> Self {
        let taken = flag.trim() == "0";
        Self::new(taken, taken)
    }
}

/// Parses a calendar token of the form `HH:MM-HH:MM|<flag>|<price>`.
pub fn parse_slot_token(token: &str) -> Result<RawSlot> {
    let mut parts = token.split('|');
    let range = parts
        .next()
        .filter(|part| !part.trim().is_empty())
        .ok_or_else(|| site_error(format!("empty slot token '{token}'")))?;
    let time: TimeRange = range
        .parse()
        .map_err(|_| site_error(format!("unreadable slot time in '{token}'")))?;
    let markers = parts
        .next()
        .map(StatusMarkers::from_flag)
        .unwrap_or_default();
    Ok(RawSlot {
        time,
        markers,
        token: token.to_string(),
    })
}

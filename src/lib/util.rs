// Various common functions

use std::fmt;

const SHADES: [char; 5] = [' ', '.', ':', '*', '#'];

///
/// Renders a spoke as a one line "scope trace": every group of pixels is
/// averaged and shown as a single shade character.
///
pub struct PrintableSpoke<'a> {
    data: &'a [u8],
    group: usize,
}

impl<'a> PrintableSpoke<'a> {
    pub fn new<T>(data: &'a T) -> PrintableSpoke<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        PrintableSpoke {
            data: data.as_ref(),
            group: 8,
        }
    }

    /// Squeeze the spoke into roughly `columns` characters.
    pub fn with_columns(mut self, columns: usize) -> Self {
        self.group = self.data.len().div_ceil(columns.max(1)).max(1);
        self
    }
}

fn shade(sum: u32, count: u32) -> char {
    let avg = sum / count.max(1);
    match avg {
        0 => SHADES[0],
        1..32 => SHADES[1],
        32..96 => SHADES[2],
        96..192 => SHADES[3],
        _ => SHADES[4],
    }
}

impl fmt::Display for PrintableSpoke<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for chunk in self.data.chunks(self.group) {
            let sum: u32 = chunk.iter().map(|b| *b as u32).sum();
            write!(f, "{}", shade(sum, chunk.len() as u32))?;
        }
        write!(f, "]")?;
        Ok(())
    }
}

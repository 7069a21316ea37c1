use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DocumentError;

lazy_static! {
    static ref CELL_NAME_REGEX: Regex = Regex::new(r"^([A-Za-z]+)([0-9]+)$").unwrap();
}

/// Zero-based position of a cell in a document.
///
/// Displayed in spreadsheet notation, so `CellRef { row: 0, col: 0 }` is `A1`
/// and `CellRef { row: 11, col: 27 }` is `AB12`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub fn new(row: usize, col: usize) -> Self {
        CellRef { row, col }
    }

    /// Column letters for a zero-based column index (`0` -> `A`, `26` -> `AA`).
    pub fn col_to_letter(col: usize) -> String {
        let mut col = col + 1;
        let mut result = String::new();
        while col > 0 {
            col -= 1;
            result.push(((col % 26) as u8 + b'A') as char);
            col /= 26;
        }
        result.chars().rev().collect()
    }

    /// Zero-based column index for column letters; `None` for an empty string.
    pub fn letter_to_col(letters: &str) -> Option<usize> {
        if letters.is_empty() {
            return None;
        }
        letters
            .chars()
            .try_fold(0usize, |acc, c| {
                let c = c.to_ascii_uppercase();
                if !c.is_ascii_uppercase() {
                    return None;
                }
                acc.checked_mul(26)?
                    .checked_add((c as u8 - b'A') as usize + 1)
            })
            .map(|col| col - 1)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::col_to_letter(self.col), self.row + 1)
    }
}

impl FromStr for CellRef {
    type Err = DocumentError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || DocumentError::InvalidCellName(name.to_string());
        let caps = CELL_NAME_REGEX.captures(name.trim()).ok_or_else(invalid)?;

        let col = Self::letter_to_col(&caps[1]).ok_or_else(invalid)?;
        let row = caps[2].parse::<usize>().map_err(|_| invalid())?;
        if row == 0 {
            return Err(invalid());
        }
        Ok(CellRef { row: row - 1, col })
    }
}

use std::fmt;
use unicode_width::UnicodeWidthChar;

// Horizontal space that the string would occupy on the screen.
pub fn str_width(s: &str) -> usize {
    s.chars().map(|c| c.width().unwrap_or(0)).sum()
}

// Longest prefix that fits in `width` columns.
pub fn str_prefix_with_width(s: &str, width: usize) -> (/*bytes*/ usize, /*width*/ usize) {
    let mut w = 0usize;
    for (i, c) in s.char_indices() {
        let cw = c.width().unwrap_or(0);
        if w + cw > width {
            return (i, w);
        }
        w += cw;
    }
    (s.len(), w)
}

// Prints numbers with a few digits of precision and optional K/M/G suffix, e.g. "42", "12.4K", "123M".
pub struct PrettyCount(pub usize);
impl fmt::Display for PrettyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x < 1000 {                          write!(f, "{}", x) }
        else if x < 1000_000 {                 write!(f, "{:.3} K", x as f64 / 1e3) }
        else if x < 1000_000_000 {             write!(f, "{:.3} M", x as f64 / 1e6) }
        else if x < 1000_000_000_000 {         write!(f, "{:.3} G", x as f64 / 1e9) }
        else {                                 write!(f, "{:.3} T", x as f64 / 1e12) }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::*;

    #[test]
    fn widths() {
        assert_eq!(str_width("abc"), 3);
        assert_eq!(str_width("…"), 1);
        assert_eq!(str_width("日本"), 4);
        assert_eq!(str_prefix_with_width("日本語", 5), (6, 4));
        assert_eq!(str_prefix_with_width("abc", 10), (3, 3));
        assert_eq!(format!("{}", PrettyCount(12400)), "12.400 K");
    }
}

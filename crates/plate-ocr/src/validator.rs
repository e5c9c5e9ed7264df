//! Syntactic validation of mainland Chinese license plates.
//!
//! Accepted shapes:
//! - regular: province, issuing-office letter, 4 alphanumerics and one class
//!   character (alphanumeric or one of 挂 学 警 港 澳 领)
//! - new energy: province, letter, 6 alphanumerics
//! - military `AB12345`, armed police `WJ京1234X`, embassy `使123456` / `123456使`
//!
//! Letters `I` and `O` never appear after the issuing-office letter.

use once_cell::sync::Lazy;
use regex::Regex;

const PROVINCES: &str = "京津沪渝冀豫云辽黑湘皖鲁新苏浙赣鄂桂甘晋蒙陕吉闽贵粤青藏川宁琼";

static PLATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let p = PROVINCES;
    let body = "A-HJ-NP-Z0-9";
    let pattern = format!(
        "^(?:[{p}][A-Z][{body}]{{4}}[{body}挂学警港澳领]\
         |[{p}][A-Z][{body}]{{6}}\
         |[A-Z]{{2}}[0-9]{{5}}\
         |WJ[{p}]?[0-9]{{4}}[0-9A-Z]\
         |使[0-9]{{6}}\
         |[0-9]{{6}}使)$"
    );
    Regex::new(&pattern).expect("plate pattern is a valid regex")
});

/// Returns true when `text` is a syntactically valid plate.
pub fn is_valid_plate(text: &str) -> bool {
    PLATE_PATTERN.is_match(text)
}

// src/normalize.rs
//! Domain name normalization.
//!
//! Every key in the sparse tree and in the domain-tree set is the normalized
//! form of a name: IDNA toASCII, lowercased, reduced to the registrable
//! domain (eTLD+1 per the public suffix list). Caller-supplied names are
//! normalized on entry; names that do not normalize are rejected.

use crate::error::{MapError, MapResult};

/// `eTLD+1(lowercase(toASCII(name)))`
pub fn normalize_domain_name(raw: &str) -> MapResult<String> {
    let ascii = idna::domain_to_ascii(raw)
        .map_err(|e| MapError::validation(format!("invalid domain name {raw:?}: {e}")))?;
    let lower = ascii.to_lowercase();
    let registrable = psl::domain_str(&lower).ok_or_else(|| {
        MapError::validation(format!("no registrable domain in {raw:?} (after IDNA: {lower:?})"))
    })?;
    Ok(registrable.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names() {
        assert_eq!(normalize_domain_name("example.com").unwrap(), "example.com");
        assert_eq!(normalize_domain_name("Example.COM").unwrap(), "example.com");
    }

    #[test]
    fn subdomains_reduce_to_etld_plus_one() {
        assert_eq!(normalize_domain_name("www.example.com").unwrap(), "example.com");
        assert_eq!(normalize_domain_name("a.b.c.example.co.uk").unwrap(), "example.co.uk");
    }

    #[test]
    fn unicode_names_go_through_idna() {
        assert_eq!(normalize_domain_name("bücher.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn bare_suffix_is_rejected() {
        assert!(normalize_domain_name("com").is_err());
        assert!(normalize_domain_name("co.uk").is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(normalize_domain_name("").is_err());
    }
}

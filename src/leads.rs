use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadHit {
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Scan user-supplied text for contact identifiers. Email and phone are
/// matched independently; the first hit of each kind wins. Returns `None`
/// when neither pattern matched. Pure: the same text always yields the same
/// result.
pub fn extract(text: &str) -> Option<LeadHit> {
    let email = Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
        .ok()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str().to_string());

    // Australian mobile formats first, then a bare 10-11 digit run.
    let phone = Regex::new(r"(?:\+?61\s?4|04)\d{2}[\s\-]?\d{3}[\s\-]?\d{3}")
        .ok()
        .and_then(|re| re.find(text))
        .or_else(|| {
            Regex::new(r"\b\d{10,11}\b")
                .ok()
                .and_then(|re| re.find(text))
        })
        .map(|m| m.as_str().to_string());

    if email.is_none() && phone.is_none() {
        return None;
    }
    Some(LeadHit { email, phone })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_email_and_phone() {
        let hit = extract("contact me at a@b.com or 0412345678").expect("lead expected");
        assert_eq!(hit.email.as_deref(), Some("a@b.com"));
        assert_eq!(hit.phone.as_deref(), Some("0412345678"));
    }

    #[test]
    fn extracts_email_alone() {
        let hit = extract("reach sales@example.com.au for pricing").expect("lead expected");
        assert_eq!(hit.email.as_deref(), Some("sales@example.com.au"));
        assert_eq!(hit.phone, None);
    }

    #[test]
    fn extracts_spaced_mobile_and_international_prefix() {
        let hit = extract("call 0412 345 678 after lunch").expect("lead expected");
        assert_eq!(hit.phone.as_deref(), Some("0412 345 678"));

        let hit = extract("or +61 412 345 678").expect("lead expected");
        assert!(hit.phone.is_some());
    }

    #[test]
    fn falls_back_to_plain_digit_run() {
        let hit = extract("landline is 0298765432").expect("lead expected");
        assert_eq!(hit.phone.as_deref(), Some("0298765432"));
    }

    #[test]
    fn no_contact_info_yields_none() {
        assert_eq!(extract("what time do you open tomorrow?"), None);
        assert_eq!(extract(""), None);
    }

    #[test]
    fn extraction_is_deterministic() {
        let text = "ping a@b.com or 0412345678";
        assert_eq!(extract(text), extract(text));
    }
}

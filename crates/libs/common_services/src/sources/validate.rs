use crate::sources::{FailureReason, FetchRequest};

const PDF_MAGIC: &[u8] = b"%PDF-";

#[must_use]
pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Checks a body against what the job payload says it should be.
pub fn check_expectations(request: &FetchRequest, bytes: &[u8]) -> Result<(), FailureReason> {
    if bytes.is_empty() {
        return Err(FailureReason::Corrupt("empty body".to_owned()));
    }
    if let Some(expected) = request.expected_size
        && expected != bytes.len() as u64
    {
        return Err(FailureReason::Corrupt(format!(
            "expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    if let Some(expected) = &request.expected_hash {
        let actual = content_hash(bytes);
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(FailureReason::Corrupt(format!(
                "checksum mismatch, expected {expected}, got {actual}"
            )));
        }
    }
    Ok(())
}

/// Rejects bodies that don't start like a PDF, which is what origins serve for
/// soft-404 pages, age gates and captchas.
pub fn require_pdf(bytes: &[u8]) -> Result<(), FailureReason> {
    if is_pdf(bytes) {
        Ok(())
    } else {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(16)]).into_owned();
        Err(FailureReason::Corrupt(format!("not a PDF, starts with {head:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_types::FetchPayload;

    fn request() -> FetchRequest {
        FetchRequest::from(&FetchPayload::new("DataSet 1", 1))
    }

    #[test]
    fn html_is_not_a_pdf() {
        assert!(require_pdf(b"%PDF-1.7\n...").is_ok());
        assert!(matches!(
            require_pdf(b"<!DOCTYPE html><html>"),
            Err(FailureReason::Corrupt(_))
        ));
    }

    #[test]
    fn size_and_hash_expectations() {
        let body = b"%PDF-1.4 body";
        assert!(check_expectations(&request(), body).is_ok());
        assert!(check_expectations(&request(), b"").is_err());

        let mut sized = request();
        sized.expected_size = Some(3);
        assert!(check_expectations(&sized, body).is_err());

        let mut hashed = request();
        hashed.expected_hash = Some(content_hash(body).to_uppercase());
        assert!(check_expectations(&hashed, body).is_ok());
        hashed.expected_hash = Some(content_hash(b"other"));
        assert!(check_expectations(&hashed, body).is_err());
    }
}

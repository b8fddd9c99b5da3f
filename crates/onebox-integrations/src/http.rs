//! Shared HTTP plumbing

use url::Url;

use crate::{IntegrationError, IntegrationResult};

/// Parse a service base URL so relative joins append instead of replace
pub(crate) fn base_url(raw: &str) -> IntegrationResult<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Turn a non-2xx response into [`IntegrationError::ApiError`]
pub(crate) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> IntegrationResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(IntegrationError::ApiError {
        service,
        status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let base = base_url("http://search.internal/es").unwrap();
        assert_eq!(
            base.join("emails/_search").unwrap().as_str(),
            "http://search.internal/es/emails/_search"
        );

        let root = base_url("http://localhost:9200").unwrap();
        assert_eq!(
            root.join("emails").unwrap().as_str(),
            "http://localhost:9200/emails"
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            base_url("not a url"),
            Err(IntegrationError::InvalidUrl(_))
        ));
    }
}

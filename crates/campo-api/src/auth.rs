use axum::http::HeaderMap;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::ServerStore;

/// Tenant resolved for the authenticated request. Handlers scope every
/// query by this id; payloads never carry one.
#[derive(Debug, Clone, Copy)]
pub struct TenantContext {
    pub tenant_id: i64,
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }
    Ok(token)
}

/// Resolve the tenant for a bearer token. Unknown tokens are rejected.
/// A known token without a tenant binding only passes when the deployment
/// configures an explicit default tenant.
pub fn resolve_tenant(
    store: &ServerStore,
    config: &AppConfig,
    token: &str,
) -> Result<TenantContext, AppError> {
    let binding = store
        .tenant_for_token(token)
        .map_err(|error| AppError::internal(error.to_string()))?;

    match binding {
        None => Err(AppError::unauthorized("Unknown API token")),
        Some(Some(tenant_id)) => Ok(TenantContext { tenant_id }),
        Some(None) => config.default_tenant.map_or_else(
            || Err(AppError::unauthorized("Token has no tenant binding")),
            |tenant_id| Ok(TenantContext { tenant_id }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_extracted_case_insensitively() {
        let headers = headers_with("bearer  abc123 ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());
        assert!(extract_bearer_token(&headers_with("Basic abc")).is_err());
        assert!(extract_bearer_token(&headers_with("Bearer ")).is_err());
    }

    fn config_with_default(default_tenant: Option<i64>) -> AppConfig {
        let mut config = AppConfig::for_tests();
        config.default_tenant = default_tenant;
        config
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let store = ServerStore::open_in_memory().unwrap();
        let result = resolve_tenant(&store, &config_with_default(None), "nope");
        assert!(result.is_err());
    }

    #[test]
    fn unbound_token_requires_an_explicit_default_tenant() {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = store.create_tenant("Fundo").unwrap();
        store.create_api_token("legacy", None).unwrap();

        assert!(resolve_tenant(&store, &config_with_default(None), "legacy").is_err());

        let context =
            resolve_tenant(&store, &config_with_default(Some(tenant)), "legacy").unwrap();
        assert_eq!(context.tenant_id, tenant);
    }

    #[test]
    fn bound_token_resolves_its_own_tenant() {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = store.create_tenant("Fundo").unwrap();
        store.create_api_token("device-1", Some(tenant)).unwrap();

        let context = resolve_tenant(&store, &config_with_default(Some(999)), "device-1").unwrap();
        assert_eq!(context.tenant_id, tenant);
    }
}

//! Extract a QuerySpec from the request's URL query string.

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};

use crate::error::AppError;
use crate::query::QuerySpec;

/// `?pageSize=10&page=2&_ob={"createTime":false}&status=1` as a [`QuerySpec`].
#[derive(Clone, Debug)]
pub struct QueryParams(pub QuerySpec);

#[async_trait]
impl<S> FromRequestParts<S> for QueryParams
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
            .map_err(|e| AppError::validation(format!("bad query string: {}", e)))?;
        Ok(QueryParams(QuerySpec::from_params(&params)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use serde_json::json;

    async fn extract(uri: &str) -> Result<QuerySpec, AppError> {
        let (mut parts, _) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        QueryParams::from_request_parts(&mut parts, &()).await.map(|q| q.0)
    }

    #[tokio::test]
    async fn test_reserved_and_plain_keys() {
        let spec = extract("/project?pageSize=10&page=2&status=1&_where=%5B%7B%22whereNull%22%3A%22checker%22%7D%5D")
            .await
            .unwrap();
        assert_eq!(spec.window(), Some((10, 2)));
        assert_eq!(spec.filters, vec![("status".to_string(), json!("1"))]);
        assert_eq!(spec.condition.len(), 1);
    }

    #[tokio::test]
    async fn test_no_query_string() {
        let spec = extract("/project").await.unwrap();
        assert!(spec.is_unconditioned());
    }

    #[tokio::test]
    async fn test_unknown_operator_rejected() {
        // {"whereNull":"a","whereLike":["a","x"]}
        let err = extract(
            "/project?_where=%7B%22whereNull%22%3A%22a%22%2C%22whereLike%22%3A%5B%22a%22%2C%22x%22%5D%7D",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("unknown where operator: whereLike"));
    }

    #[tokio::test]
    async fn test_order_keys_keep_url_order() {
        // _ob={"rank":true,"createTime":false}
        let spec = extract("/project?_ob=%7B%22rank%22%3Atrue%2C%22createTime%22%3Afalse%7D")
            .await
            .unwrap();
        assert_eq!(
            spec.order_by,
            Some(vec![
                ("rank".to_string(), crate::sql::Direction::Asc),
                ("createTime".to_string(), crate::sql::Direction::Desc)
            ])
        );
    }

    #[tokio::test]
    async fn test_oversized_page_rejected() {
        let err = extract("/project?pageSize=10&page=18446744073709551615").await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}

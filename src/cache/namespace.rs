//! Request path → namespace routing.

/// Business areas that own a namespace, in lookup order.
pub const NAMESPACES: &[&str] = &[
    "produtos",
    "estoque",
    "vendas",
    "clientes",
    "fornecedores",
    "vendedores",
    "caixa",
    "financeiro",
    "vitrine",
    "contas-pagar",
    "contas-receber",
    "relatorios",
    "dashboard",
];

pub const DEFAULT_API_PREFIX: &str = "/api";

/// Maps request paths to namespace labels.
#[derive(Debug, Clone)]
pub struct NamespaceRouter {
    api_prefix: String,
}

impl NamespaceRouter {
    pub fn new(api_prefix: impl Into<String>) -> Self {
        let prefix = api_prefix.into();
        Self {
            api_prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Longest table entry that prefixes the normalized path, if any.
    ///
    /// Normalization drops the query string, the API prefix, and leading
    /// slashes. Matching is case-sensitive like the cache keys themselves.
    pub fn route(&self, path: &str) -> Option<&'static str> {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        let path = if self.api_prefix.is_empty() {
            path
        } else {
            path.strip_prefix(self.api_prefix.as_str())
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .unwrap_or(path)
        };
        let normalized = path.trim_start_matches('/');

        NAMESPACES
            .iter()
            .copied()
            .filter(|ns| normalized.starts_with(ns))
            .max_by_key(|ns| ns.len())
    }
}

impl Default for NamespaceRouter {
    fn default() -> Self {
        Self::new(DEFAULT_API_PREFIX)
    }
}

/// Compose the key stored in both tiers.
pub fn composite_key(key: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{key}"),
        None => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_prefix_after_api_segment() {
        let router = NamespaceRouter::default();
        assert_eq!(router.route("/api/produtos"), Some("produtos"));
        assert_eq!(router.route("/api/produtos/42?full=1"), Some("produtos"));
        assert_eq!(router.route("/api/caixa/abertura"), Some("caixa"));
        assert_eq!(router.route("/estoque/baixo"), Some("estoque"));
    }

    #[test]
    fn unknown_paths_have_no_namespace() {
        let router = NamespaceRouter::default();
        assert_eq!(router.route("/api/usuarios"), None);
        assert_eq!(router.route("/"), None);
        assert_eq!(router.route("/apiprodutos"), None);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let router = NamespaceRouter::default();
        assert_eq!(router.route("/api/Produtos"), None);
    }

    #[test]
    fn custom_prefix_is_stripped() {
        let router = NamespaceRouter::new("/v2/");
        assert_eq!(router.route("/v2/vendas/hoje"), Some("vendas"));
        assert_eq!(router.route("/api/vendas/hoje"), None);
    }

    #[test]
    fn composite_key_prefixes_namespace() {
        assert_eq!(
            composite_key("/api/produtos", Some("produtos")),
            "produtos:/api/produtos"
        );
        assert_eq!(composite_key("/api/usuarios", None), "/api/usuarios");
    }
}

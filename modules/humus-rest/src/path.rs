use crate::param::{ParamDeclaration, ParamLocation, ParamOption};

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(ParamDeclaration),
}

/// Route path made of literal segments and `{name}` parameters.
///
/// ```
/// use humus_rest::{param, PathBuilder};
///
/// let path = PathBuilder::new("/api/v1")
///     .segment("users")
///     .param("id", [param::regex("^[0-9]+$")]);
/// assert_eq!(path.pattern(), "/api/v1/users/{id}");
/// ```
#[derive(Debug, Clone, Default)]
pub struct PathBuilder {
    segments: Vec<Segment>,
}

impl PathBuilder {
    /// Starts from `base`; empty and slash-only bases mean the root.
    pub fn new(base: impl AsRef<str>) -> Self {
        Self::default().segment(base)
    }

    /// Appends literal segments. Slashes inside `lit` split it.
    #[must_use]
    pub fn segment(mut self, lit: impl AsRef<str>) -> Self {
        self.segments.extend(
            lit.as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| Segment::Literal(s.to_owned())),
        );
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, opts: impl IntoIterator<Item = ParamOption>) -> Self {
        let decl = ParamDeclaration::new(name, ParamLocation::Path).with_options(opts);
        self.segments.push(Segment::Param(decl));
        self
    }

    /// The route pattern, e.g. `/users/{id}`. Shared by the router and the
    /// OpenAPI `paths` key.
    pub fn pattern(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_owned();
        }
        self.segments.iter().fold(String::new(), |mut out, seg| {
            out.push('/');
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Param(p) => {
                    out.push('{');
                    out.push_str(&p.name);
                    out.push('}');
                }
            }
            out
        })
    }

    /// Pattern with parameter names erased. Two routes with the same shape
    /// cannot be told apart by the router.
    pub(crate) fn shape(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_owned();
        }
        self.segments
            .iter()
            .map(|seg| match seg {
                Segment::Literal(s) => format!("/{s}"),
                Segment::Param(_) => "/{}".to_owned(),
            })
            .collect()
    }

    pub fn params(&self) -> impl Iterator<Item = &ParamDeclaration> {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Param(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    /// Rejects segments the router cannot express.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let mut seen = Vec::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) if s.contains(['{', '}']) => {
                    return Err(format!("literal segment {s:?} contains a brace"));
                }
                Segment::Param(p) => {
                    let name = p.name.as_str();
                    if name.is_empty()
                        || name.starts_with('*')
                        || name.contains(['{', '}', '/'])
                    {
                        return Err(format!("invalid path parameter name {name:?}"));
                    }
                    if seen.contains(&name) {
                        return Err(format!("path parameter {name:?} declared twice"));
                    }
                    seen.push(name);
                }
                Segment::Literal(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::regex;

    #[test]
    fn base_and_segments_are_normalized() {
        assert_eq!(PathBuilder::new("").pattern(), "/");
        assert_eq!(PathBuilder::new("/").pattern(), "/");
        assert_eq!(PathBuilder::new("/api/").segment("/v1/users/").pattern(), "/api/v1/users");
    }

    #[test]
    fn params_become_placeholders() {
        let path = PathBuilder::new("/users")
            .param("id", [regex("^[0-9]+$")])
            .segment("posts")
            .param("post", []);
        assert_eq!(path.pattern(), "/users/{id}/posts/{post}");
        assert_eq!(path.shape(), "/users/{}/posts/{}");

        let params: Vec<_> = path.params().map(|p| (p.name.as_str(), p.required)).collect();
        assert_eq!(params, vec![("id", true), ("post", true)]);
    }

    #[test]
    fn validation_rejects_unroutable_paths() {
        assert!(PathBuilder::new("/a{b}").validate().is_err());
        assert!(PathBuilder::new("/a").param("", []).validate().is_err());
        assert!(PathBuilder::new("/a").param("*rest", []).validate().is_err());
        assert!(PathBuilder::new("/a")
            .param("id", [])
            .param("id", [])
            .validate()
            .is_err());
        assert!(PathBuilder::new("/a").param("id", []).validate().is_ok());
    }
}

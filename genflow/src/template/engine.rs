//! Deterministic rendering of a manifest into a file tree.

use handlebars::{no_escape, Handlebars, RenderErrorReason};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::manifest::{check_path, join_path};
use super::{ManifestNode, TemplateManifest};
use crate::core::{FileTree, RenderedArtifact, ServiceSpec};
use crate::errors::TemplateError;

/// Renders manifests with handlebars in strict mode.
///
/// Strict mode turns a reference to an undefined variable into an error
/// instead of empty output. HTML escaping is off since the output is
/// source code.
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("strict", &self.registry.strict_mode())
            .finish()
    }
}

impl TemplateEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(no_escape);
        Self { registry }
    }

    /// Builds the render context for a request.
    ///
    /// `flags` holds every known flag of the manifest mapped to a bool so
    /// that `{{#if flags.redis}}` never references an undefined key.
    /// Request values override config values of the same name.
    #[must_use]
    pub fn context(
        manifest: &TemplateManifest,
        spec: &ServiceSpec,
        config_values: &BTreeMap<String, Value>,
    ) -> Value {
        let flags: Map<String, Value> = manifest
            .known_flags()
            .into_iter()
            .map(|flag| {
                let enabled = spec.feature_flags.contains(&flag);
                (flag, Value::Bool(enabled))
            })
            .collect();

        let mut values: Map<String, Value> = config_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &spec.values {
            values.insert(key.clone(), value.clone());
        }

        json!({
            "service_name": spec.name,
            "env": spec.target_env,
            "owner": spec.owner,
            "template_id": manifest.template_id,
            "flags": flags,
            "flag_list": spec.feature_flags.iter().collect::<Vec<_>>(),
            "values": values,
        })
    }

    /// Renders `manifest` for `spec`.
    ///
    /// The output depends only on the manifest, the service spec and the config
    /// values, so identical inputs always produce the same checksum.
    pub fn render(
        &self,
        manifest: &TemplateManifest,
        spec: &ServiceSpec,
        config_values: &BTreeMap<String, Value>,
    ) -> Result<RenderedArtifact, TemplateError> {
        let context = Self::context(manifest, spec, config_values);
        let mut tree = FileTree::new();
        self.render_nodes(&manifest.nodes, "", spec, &context, &mut tree)?;

        tracing::debug!(
            template_id = %manifest.template_id,
            service = %spec.name,
            files = tree.len(),
            bytes = tree.total_bytes(),
            "Rendered template"
        );

        Ok(RenderedArtifact::new(&spec.name, &manifest.template_id, tree))
    }

    fn render_nodes(
        &self,
        nodes: &[ManifestNode],
        parent: &str,
        spec: &ServiceSpec,
        context: &Value,
        tree: &mut FileTree,
    ) -> Result<(), TemplateError> {
        for node in nodes {
            if !node.when.evaluate(&spec.feature_flags) {
                continue;
            }

            let raw_path = join_path(parent, &node.path);
            let segment = self.render_str(&raw_path, &node.path, context)?;
            check_path(&segment)?;
            let path = join_path(parent, &segment);

            if node.is_dir() {
                self.render_nodes(&node.children, &path, spec, context, tree)?;
                continue;
            }

            let content = node
                .content
                .as_deref()
                .ok_or_else(|| TemplateError::malformed(format!("file '{path}' has no content")))?;
            let rendered = self.render_str(&raw_path, content, context)?;

            if tree.insert(path.clone(), rendered.into_bytes()).is_some() {
                return Err(TemplateError::malformed(format!("duplicate path '{path}'")));
            }
        }
        Ok(())
    }

    fn render_str(&self, file: &str, template: &str, context: &Value) -> Result<String, TemplateError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        self.registry
            .render_template(template, context)
            .map_err(|e| match e.reason() {
                RenderErrorReason::MissingVariable(variable) => TemplateError::MissingVariable {
                    file: file.to_string(),
                    variable: variable.clone().unwrap_or_else(|| "<unknown>".to_string()),
                },
                _ => TemplateError::Render {
                    file: file.to_string(),
                    message: e.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::FlagPredicate;
    use pretty_assertions::assert_eq;

    fn manifest() -> TemplateManifest {
        TemplateManifest::new("tiny")
            .with_flags(["swagger", "redis"])
            .with_node(ManifestNode::file("README.md", "# {{service_name}} ({{env}}) by {{owner}}"))
            .with_node(ManifestNode::dir(
                "src/{{service_name}}",
                vec![
                    ManifestNode::file(
                        "app.ts",
                        "{{#if flags.redis}}import redis from 'redis';\n{{/if}}export const name = '{{service_name}}';\n",
                    ),
                    ManifestNode::file("swagger.ts", "// docs for {{service_name}}")
                        .when(FlagPredicate::flag("swagger")),
                ],
            ))
    }

    fn spec() -> ServiceSpec {
        ServiceSpec::new("foo-api", "tiny", "staging", "team-a")
    }

    #[test]
    fn test_render_paths_and_content() {
        let engine = TemplateEngine::new();
        let artifact = engine.render(&manifest(), &spec(), &BTreeMap::new()).unwrap();

        assert_eq!(artifact.files.paths(), vec!["README.md", "src/foo-api/app.ts"]);
        assert_eq!(
            artifact.files.get("README.md"),
            Some(b"# foo-api (staging) by team-a".as_slice())
        );
        assert_eq!(
            artifact.files.get("src/foo-api/app.ts"),
            Some(b"export const name = 'foo-api';\n".as_slice())
        );
    }

    #[test]
    fn test_flags_gate_files_and_blocks() {
        let engine = TemplateEngine::new();
        let spec = spec().with_flags(["swagger", "redis"]);
        let artifact = engine.render(&manifest(), &spec, &BTreeMap::new()).unwrap();

        assert!(artifact.files.contains("src/foo-api/swagger.ts"));
        let app = String::from_utf8(artifact.files.get("src/foo-api/app.ts").unwrap().to_vec()).unwrap();
        assert!(app.starts_with("import redis"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let engine = TemplateEngine::new();
        let a = engine.render(&manifest(), &spec().with_flag("redis"), &BTreeMap::new()).unwrap();
        let b = TemplateEngine::new()
            .render(&manifest(), &spec().with_flag("redis"), &BTreeMap::new())
            .unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a, b);

        let c = engine.render(&manifest(), &spec(), &BTreeMap::new()).unwrap();
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_missing_variable_names_file_and_variable() {
        let manifest = TemplateManifest::new("broken")
            .with_node(ManifestNode::dir("config", vec![ManifestNode::file("db.env", "DB_URL={{db_url}}")]));

        let err = TemplateEngine::new()
            .render(&manifest, &spec(), &BTreeMap::new())
            .unwrap_err();

        match err {
            TemplateError::MissingVariable { file, variable } => {
                assert_eq!(file, "config/db.env");
                assert!(variable.contains("db_url"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_values_are_available_and_request_overrides_config() {
        let manifest = TemplateManifest::new("vals")
            .with_node(ManifestNode::file("port.txt", "{{values.port}} {{values.region}}"));
        let config = BTreeMap::from([
            ("port".to_string(), json!(8080)),
            ("region".to_string(), json!("eu-west-1")),
        ]);
        let spec = spec().with_value("port", json!(9000));

        let artifact = TemplateEngine::new().render(&manifest, &spec, &config).unwrap();
        assert_eq!(artifact.files.get("port.txt"), Some(b"9000 eu-west-1".as_slice()));
    }

    #[test]
    fn test_no_html_escaping() {
        let manifest = TemplateManifest::new("esc").with_node(ManifestNode::file("q.txt", "{{values.q}}"));
        let spec = spec().with_value("q", json!("a && b <c>"));

        let artifact = TemplateEngine::new().render(&manifest, &spec, &BTreeMap::new()).unwrap();
        assert_eq!(artifact.files.get("q.txt"), Some(b"a && b <c>".as_slice()));
    }

    #[test]
    fn test_rendered_path_is_validated() {
        let manifest = TemplateManifest::new("escape")
            .with_node(ManifestNode::file("{{values.dir}}/x.txt", "x"));
        let spec = spec().with_value("dir", json!(".."));

        let err = TemplateEngine::new().render(&manifest, &spec, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MalformedManifest { .. }));
    }

    #[test]
    fn test_rendered_duplicate_paths() {
        let manifest = TemplateManifest::new("dup")
            .with_node(ManifestNode::file("{{service_name}}.txt", "a"))
            .with_node(ManifestNode::file("foo-api.txt", "b"));

        let err = TemplateEngine::new().render(&manifest, &spec(), &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_context_shape() {
        let context = TemplateEngine::context(&manifest(), &spec().with_flag("redis"), &BTreeMap::new());

        assert_eq!(context["flags"]["redis"], json!(true));
        assert_eq!(context["flags"]["swagger"], json!(false));
        assert_eq!(context["flag_list"], json!(["redis"]));
        assert_eq!(context["template_id"], json!("tiny"));
    }
}

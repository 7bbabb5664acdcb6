use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub slug: String,
    pub label: String,
    /// Hard provider-side ceiling on outputs per job submission.
    pub max_images_per_job: u64,
    pub accepts_input_images: bool,
    pub default_aspect_ratio: Option<String>,
}

impl ModelSpec {
    pub fn max_images_per_job(&self) -> u64 {
        self.max_images_per_job.max(1)
    }
}

/// Catalog of generation models, injected into the orchestrator at
/// construction and queried synchronously. There is no ambient registry.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, slug: &str) -> Option<&ModelSpec> {
        self.models.get(slug)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn default_model(&self) -> Option<&ModelSpec> {
        self.models.values().next()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |slug: &str,
                      label: &str,
                      max_images_per_job: u64,
                      accepts_input_images: bool,
                      default_aspect_ratio: Option<&str>| {
        map.insert(
            slug.to_string(),
            ModelSpec {
                slug: slug.to_string(),
                label: label.to_string(),
                max_images_per_job,
                accepts_input_images,
                default_aspect_ratio: default_aspect_ratio.map(str::to_string),
            },
        );
    };

    insert("gpt-image-1", "GPT Image 1", 4, true, Some("1:1"));
    insert("gpt-image-1-mini", "GPT Image 1 Mini", 4, true, Some("1:1"));
    insert(
        "gemini-2.5-flash-image",
        "Gemini 2.5 Flash Image",
        1,
        true,
        Some("1:1"),
    );
    insert("imagen-4", "Imagen 4", 4, false, Some("1:1"));
    insert("flux-2-pro", "FLUX.2 Pro", 1, true, Some("4:3"));
    insert("flux-2-flex", "FLUX.2 Flex", 1, true, Some("4:3"));
    insert("sdxl", "Stable Diffusion XL", 4, false, Some("1:1"));

    map
}

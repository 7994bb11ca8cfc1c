//! Model loading: fetch the artifact, build the graph, warm it up.
//!
use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::Client;

use crate::{
    fetch,
    nn::{InputShape, ModelHandle, TractModel},
    SegError,
};

const MODEL_FILE: &str = "model.onnx";
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Where the model bundle lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModelSource {
    Http(String),
    File(PathBuf),
}

impl ModelSource {
    /// Resolve `{base}/{model_name}_web_model/model.onnx`.
    pub fn resolve(base: &str, model_name: &str) -> Self {
        let bundle = format!("{model_name}_web_model");
        if base.starts_with("http://") || base.starts_with("https://") {
            Self::Http(format!(
                "{}/{}/{}",
                base.trim_end_matches('/'),
                bundle,
                MODEL_FILE
            ))
        } else {
            Self::File(PathBuf::from(base).join(bundle).join(MODEL_FILE))
        }
    }

    pub fn location(&self) -> String {
        match self {
            Self::Http(url) => url.clone(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

pub struct ModelLoader {
    source: ModelSource,
    client: Client,
    cache_dir: Option<PathBuf>,
    input_shape: Option<InputShape>,
    retries: u32,
}

impl ModelLoader {
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            client: Client::new(),
            cache_dir: None,
            input_shape: None,
            retries: 0,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    /// Pin the model input, for graphs exported with dynamic dimensions.
    pub fn with_input_shape(mut self, input_shape: Option<InputShape>) -> Self {
        self.input_shape = input_shape;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Load, build and warm up the model, retrying failed attempts.
    pub async fn load<P>(&self, mut progress: P) -> Result<ModelHandle, SegError>
    where
        P: FnMut(f32) + Send,
    {
        let mut attempt = 0;
        loop {
            match self.load_once(&mut progress).await {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "Loading {} failed ({}), retry {}/{}",
                        self.source.location(),
                        e,
                        attempt,
                        self.retries
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_once<P>(&self, progress: &mut P) -> Result<ModelHandle, SegError>
    where
        P: FnMut(f32) + Send,
    {
        log::info!("Loading model from {}", self.source.location());
        let bytes = self.fetch(progress).await?;
        let input_shape = self.input_shape;

        // Parsing, optimisation and the warm-up pass are CPU bound
        let res = tokio::task::spawn_blocking(move || {
            let model = TractModel::from_bytes(&bytes, input_shape)?;
            ModelHandle::new(Arc::new(model))
        })
        .await
        .map_err(|e| SegError::ModelFormat(format!("model build task failed: {e}")))?;

        // A cached artifact that is not a model would be served again on retry
        if let (Err(SegError::ModelFormat(_)), ModelSource::Http(url), Some(cache_dir)) =
            (&res, &self.source, &self.cache_dir)
        {
            fetch::evict_cached(cache_dir, url).await;
        }
        res
    }

    /// Fetch the raw artifact bytes.
    pub async fn fetch<P>(&self, progress: &mut P) -> Result<Bytes, SegError>
    where
        P: FnMut(f32) + Send,
    {
        match (&self.source, &self.cache_dir) {
            (ModelSource::Http(url), Some(cache_dir)) => {
                fetch::download_cached(&self.client, url, cache_dir, progress).await
            }
            (ModelSource::Http(url), None) => fetch::download(&self.client, url, progress).await,
            (ModelSource::File(path), _) => fetch::read_file(path, progress).await,
        }
    }
}

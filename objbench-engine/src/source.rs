//! Object descriptors and synthetic object sources.
//!
//! [`RandomSource`] generates objects with random names and contents. Sizes are either fixed or
//! follow a *LogNormal* distribution defined by the `p50` and `p99` of object sizes, which models
//! the real-world shape of many small objects with a long tail of larger ones.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::{fmt, io, task};

use rand::distr::{Alphanumeric, SampleString};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use tokio::io::{AsyncRead, ReadBuf};

use crate::client::ObjectReader;
use crate::error::{Error, Result};

/// Content type of synthetic objects.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Describes an object a benchmark can operate on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Object {
    /// Full object name, including its prefix.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Content type used when uploading.
    pub content_type: String,
    /// Version assigned by the storage after upload.
    pub version_id: Option<String>,
    /// Hex MD5 digest of the uploaded contents, if known.
    pub md5: Option<String>,
}

impl Object {
    /// Creates a descriptor for an object that already exists in the storage.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            ..Default::default()
        }
    }

    /// The part of the name before the last `/`, or an empty string.
    pub fn prefix(&self) -> &str {
        self.name
            .rsplit_once('/')
            .map(|(prefix, _)| prefix)
            .unwrap_or_default()
    }
}

/// An object together with its readable contents.
pub struct SourceObject {
    /// Describes the object.
    pub object: Object,
    /// Exactly `object.size` bytes of contents.
    pub body: ObjectReader,
}

impl fmt::Debug for SourceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceObject")
            .field("object", &self.object)
            .field("body", &format_args!("[Reader]"))
            .finish()
    }
}

/// Supplies synthetic objects for uploads.
pub trait ObjectSource: Send + 'static {
    /// Returns the next object to upload.
    fn object(&mut self) -> SourceObject;

    /// The prefix under which all objects of this source are named.
    fn prefix(&self) -> &str;
}

/// Creates one [`ObjectSource`] per worker.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn ObjectSource> + Send + Sync>;

/// The objects a download benchmark operates on.
#[derive(Clone, Debug, Default)]
pub struct ObjectSet(Vec<Object>);

impl ObjectSet {
    /// Adds an object.
    pub fn push(&mut self, object: Object) {
        self.0.push(object);
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no objects.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Picks an object uniformly at random.
    pub fn choose<R: Rng>(&self, rng: &mut R) -> Option<&Object> {
        if self.0.is_empty() {
            return None;
        }
        self.0.get(rng.random_range(0..self.0.len()))
    }

    /// Iterates over all objects.
    pub fn iter(&self) -> std::slice::Iter<'_, Object> {
        self.0.iter()
    }

    /// Distinct prefixes of all objects.
    pub fn prefixes(&self) -> BTreeSet<String> {
        self.0.iter().map(|o| o.prefix().to_owned()).collect()
    }
}

/// How [`RandomSource`] picks object sizes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizeDistribution {
    /// Every object has the same size.
    Fixed(u64),
    /// Sizes follow a LogNormal distribution with the given percentiles.
    LogNormal {
        /// Median size.
        p50: u64,
        /// 99th percentile size.
        p99: u64,
    },
}

#[derive(Clone, Copy, Debug)]
enum Sizes {
    Fixed(u64),
    LogNormal(LogNormal<f64>),
}

impl Sizes {
    fn new(distribution: SizeDistribution) -> Result<Self> {
        match distribution {
            SizeDistribution::Fixed(size) => Ok(Self::Fixed(size)),
            SizeDistribution::LogNormal { p50, p99 } => {
                if p50 == 0 || p99 < p50 {
                    return Err(Error::Config(format!(
                        "invalid size distribution: p50 {p50}, p99 {p99}"
                    )));
                }

                // Inspired by <https://stats.stackexchange.com/a/649432>
                let p50 = p50 as f64;
                let p99 = p99 as f64;
                let mu = p50.ln();
                let sigma = (p99.ln() - mu) / 2.3263;

                LogNormal::new(mu, sigma)
                    .map(Self::LogNormal)
                    .map_err(|e| Error::Config(format!("invalid size distribution: {e}")))
            }
        }
    }

    fn sample(&self, rng: &mut SmallRng) -> u64 {
        match self {
            Self::Fixed(size) => *size,
            Self::LogNormal(distribution) => distribution.sample(rng) as u64,
        }
    }
}

/// Generates objects with random names and contents under a random prefix.
#[derive(Debug)]
pub struct RandomSource {
    rng: SmallRng,
    prefix: String,
    sizes: Sizes,
}

impl RandomSource {
    /// Creates a source seeded from the given value.
    pub fn new(sizes: SizeDistribution, seed: u64) -> Result<Self> {
        Ok(Self::with_sizes(Sizes::new(sizes)?, seed))
    }

    fn with_sizes(sizes: Sizes, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let prefix = Alphanumeric.sample_string(&mut rng, 8);
        Self { rng, prefix, sizes }
    }

    /// Returns a factory producing independently seeded sources.
    pub fn factory(sizes: SizeDistribution) -> Result<SourceFactory> {
        let sizes = Sizes::new(sizes)?;
        Ok(Arc::new(move || {
            Box::new(RandomSource::with_sizes(sizes, rand::random())) as Box<dyn ObjectSource>
        }))
    }
}

impl ObjectSource for RandomSource {
    fn object(&mut self) -> SourceObject {
        let size = self.sizes.sample(&mut self.rng);
        let name = format!(
            "{}/{}.rnd",
            self.prefix,
            Alphanumeric.sample_string(&mut self.rng, 16)
        );
        let payload = Payload {
            len: size,
            rng: SmallRng::seed_from_u64(self.rng.next_u64()),
        };

        SourceObject {
            object: Object::new(name, size),
            body: Box::pin(payload),
        }
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Randomized contents of an object.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The remaining length of the payload in bytes.
    pub len: u64,
    /// The RNG used to fill the payload with random bytes.
    pub rng: SmallRng,
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;

        let fill_buf = buf.initialize_unfilled_to(len_to_fill);
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        buf.advance(len_to_fill);

        task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let mut source = RandomSource::new(
            SizeDistribution::LogNormal {
                p50: 100,
                p99: 1000,
            },
            7,
        )
        .unwrap();

        let mut sizes: Vec<_> = (0..1000).map(|_| source.object().object.size).collect();
        sizes.sort_unstable();

        let p50 = sizes[500];
        assert!((50..200).contains(&p50), "p50 was {p50}");
    }

    #[test]
    fn invalid_distribution_is_rejected() {
        let result = RandomSource::new(SizeDistribution::LogNormal { p50: 100, p99: 10 }, 0);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn objects_share_the_source_prefix() {
        let mut source = RandomSource::new(SizeDistribution::Fixed(4096), 1).unwrap();
        let prefix = source.prefix().to_owned();

        let SourceObject { object, mut body } = source.object();
        assert_eq!(object.prefix(), prefix);
        assert_eq!(object.size, 4096);

        let mut contents = Vec::new();
        body.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents.len(), 4096);
    }

    #[test]
    fn object_set_prefixes_are_distinct() {
        let mut set = ObjectSet::default();
        set.push(Object::new("a/1", 1));
        set.push(Object::new("a/2", 1));
        set.push(Object::new("b/c/3", 1));
        set.push(Object::new("plain.csv", 1));

        let prefixes: Vec<_> = set.prefixes().into_iter().collect();
        assert_eq!(prefixes, ["", "a", "b/c"]);
    }
}

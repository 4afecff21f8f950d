use crate::SharedProvider;
use anyhow::Result;
use async_trait::async_trait;
use peerpod_common::ProviderError;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builds a provider from its own command line (flags after `--`, env fallbacks apply).
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, ctx: &CancellationToken, args: &[String]) -> Result<SharedProvider>;
}

pub struct ProviderRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn ProviderFactory>>>,
}

static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry holding every back-end compiled into this build.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        #[cfg(feature = "alibaba")]
        registry.register(crate::alibaba::PROVIDER_NAME, Arc::new(crate::alibaba::AlibabaFactory));
        #[cfg(feature = "byom")]
        registry.register(crate::byom::PROVIDER_NAME, Arc::new(crate::byom::ByomFactory));
        #[cfg(feature = "docker")]
        registry.register(crate::docker::PROVIDER_NAME, Arc::new(crate::docker::DockerFactory));
        #[cfg(feature = "openstack")]
        registry.register(crate::openstack::PROVIDER_NAME, Arc::new(crate::openstack::OpenStackFactory));
        #[cfg(feature = "powervs")]
        registry.register(crate::powervs::PROVIDER_NAME, Arc::new(crate::powervs::PowerVsFactory));
        registry
    }

    /// Process-wide registry, populated with the built-in back-ends on first use.
    pub fn global() -> &'static ProviderRegistry {
        GLOBAL.get_or_init(Self::with_builtin)
    }

    pub fn register(&self, name: &str, factory: Arc<dyn ProviderFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(name.to_string(), factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderFactory>, ProviderError> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider {
                name: name.to_string(),
                registered: factories.keys().cloned().collect(),
            })
    }

    /// Look up `name`, build it from `args` and run its config verifier.
    pub async fn create(
        &self,
        ctx: &CancellationToken,
        name: &str,
        args: &[String],
    ) -> Result<SharedProvider> {
        let factory = self.get(name)?;
        let provider = factory.build(ctx, args).await?;
        provider.config_verifier()?;
        info!("provider {} ready", name);
        Ok(provider)
    }
}

/// Parse a back-end's clap config from its argument slice.
pub fn parse_config<C: clap::Parser>(provider: &str, args: &[String]) -> Result<C, ProviderError> {
    C::try_parse_from(std::iter::once(provider.to_string()).chain(args.iter().cloned()))
        .map_err(|e| ProviderError::ConfigInvalid(e.to_string().trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provider;
    use peerpod_common::cloudinit::CloudConfigGenerator;
    use peerpod_common::{Instance, InstanceTypeSpec};

    struct Nop;

    #[async_trait]
    impl Provider for Nop {
        async fn create_instance(
            &self,
            _ctx: &CancellationToken,
            pod_name: &str,
            _sandbox_id: &str,
            _cloud_config: &dyn CloudConfigGenerator,
            _spec: &InstanceTypeSpec,
        ) -> Result<Instance> {
            Ok(Instance::new(pod_name, pod_name, vec![]))
        }
        async fn delete_instance(&self, _ctx: &CancellationToken, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn teardown(&self) -> Result<()> {
            Ok(())
        }
        fn config_verifier(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "nop"
        }
    }

    struct NopFactory;

    #[async_trait]
    impl ProviderFactory for NopFactory {
        async fn build(&self, _ctx: &CancellationToken, _args: &[String]) -> Result<SharedProvider> {
            Ok(Arc::new(Nop))
        }
    }

    #[derive(clap::Parser, Debug)]
    struct DemoConfig {
        #[arg(long = "demo-size", default_value_t = 3)]
        size: u32,
    }

    #[test]
    fn builtin_names_are_sorted() {
        let names = ProviderRegistry::with_builtin().names();
        assert_eq!(
            names,
            vec!["alibabacloud", "byom", "docker", "ibmcloud-powervs", "openstack"]
        );
    }

    #[test]
    fn unknown_name_lists_registered() {
        let registry = ProviderRegistry::empty();
        registry.register("zeta", Arc::new(NopFactory));
        registry.register("alpha", Arc::new(NopFactory));
        let err = registry.get("gamma").err().unwrap();
        assert_eq!(
            err.to_string(),
            "unknown provider \"gamma\", registered providers: alpha, zeta"
        );
    }

    #[tokio::test]
    async fn create_runs_the_factory() {
        let registry = ProviderRegistry::empty();
        registry.register("nop", Arc::new(NopFactory));
        let provider = registry
            .create(&CancellationToken::new(), "nop", &[])
            .await
            .unwrap();
        assert_eq!(provider.name(), "nop");
    }

    #[test]
    fn parse_config_reports_bad_flags() {
        let cfg: DemoConfig = parse_config("demo", &["--demo-size".to_string(), "5".to_string()]).unwrap();
        assert_eq!(cfg.size, 5);
        let err = parse_config::<DemoConfig>("demo", &["--nope".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "configuration-invalid");
    }
}

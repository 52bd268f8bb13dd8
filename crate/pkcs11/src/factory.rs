//! Builds crypt services out of the declarative configuration.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::info;

use crate::{
    conf::{
        ModuleConfig, P11ModuleConf, Pkcs11Conf, MODULE_TYPE_EMULATOR, MODULE_TYPE_HSMPROXY,
        MODULE_TYPE_NATIVE,
    },
    emulator::EmulatorP11Module,
    error::{TokenError, TokenResult},
    module::P11Module,
    native::NativeP11Module,
    password::PasswordResolver,
    proxy::{HsmProxyP11Module, ProxyTransport},
};

/// Access point to one module.
#[derive(Clone)]
pub struct P11CryptService {
    module: Arc<dyn P11Module>,
}

impl P11CryptService {
    pub fn module(&self) -> &Arc<dyn P11Module> {
        &self.module
    }
}

/// Builds and caches one [`P11CryptService`] per configured module.
///
/// The `type` field of the module configuration decides the backend; proxy
/// modules additionally need a transport registered under the module name.
pub struct P11CryptServiceFactory {
    conf: Pkcs11Conf,
    password_resolver: Option<Arc<dyn PasswordResolver>>,
    transports: HashMap<String, Arc<dyn ProxyTransport>>,
    services: Mutex<HashMap<String, P11CryptService>>,
}

impl P11CryptServiceFactory {
    pub fn new(conf: Pkcs11Conf, password_resolver: Option<Arc<dyn PasswordResolver>>) -> Self {
        Self {
            conf,
            password_resolver,
            transports: HashMap::new(),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the transport a `hsmproxy` module will tunnel through.
    pub fn with_transport(
        mut self,
        module_name: impl Into<String>,
        transport: Arc<dyn ProxyTransport>,
    ) -> Self {
        self.transports.insert(module_name.into(), transport);
        self
    }

    /// Returns the crypt service of the module `name`, building it on first
    /// use.
    pub fn crypt_service(&self, name: &str) -> TokenResult<P11CryptService> {
        let mut services = self.services.lock().expect("factory cache poisoned");
        if let Some(service) = services.get(name) {
            return Ok(service.clone());
        }

        let module_config = self
            .conf
            .modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| TokenError::Default(format!("unknown PKCS#11 module '{name}'")))?;

        let module = self.build_module(module_config)?;
        info!("initialized PKCS#11 module '{name}'\n{}", module.description());
        let service = P11CryptService { module };
        services.insert(name.to_string(), service.clone());
        Ok(service)
    }

    fn build_module(&self, module_config: &ModuleConfig) -> TokenResult<Arc<dyn P11Module>> {
        let conf = P11ModuleConf::new(
            module_config,
            &self.conf.mechanism_sets,
            self.password_resolver.clone(),
        )
        .map_err(|e| TokenError::Default(e.to_string()))?;

        Ok(match conf.module_type() {
            MODULE_TYPE_EMULATOR => Arc::new(EmulatorP11Module::new(conf)?),
            MODULE_TYPE_NATIVE => Arc::new(NativeP11Module::new(conf)?),
            MODULE_TYPE_HSMPROXY => {
                let transport = self
                    .transports
                    .get(conf.name())
                    .cloned()
                    .ok_or_else(|| {
                        TokenError::Default(format!(
                            "no transport registered for proxy module '{}'",
                            conf.name()
                        ))
                    })?;
                Arc::new(HsmProxyP11Module::new(conf, transport)?)
            }
            other => {
                return Err(TokenError::Default(format!(
                    "unknown module type '{other}'"
                )))
            }
        })
    }

    /// Closes every module built so far.
    pub fn close(&self) {
        let mut services = self.services.lock().expect("factory cache poisoned");
        for (name, service) in services.drain() {
            info!("closing PKCS#11 module '{name}'");
            service.module.close();
        }
    }
}

impl Drop for P11CryptServiceFactory {
    fn drop(&mut self) {
        self.close();
    }
}

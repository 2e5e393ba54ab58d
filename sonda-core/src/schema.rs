//! # Schema Resolution
//!
//! A session needs a full protobuf schema before it can build input forms or
//! encode requests. This module resolves one from either of two sources:
//!
//! * [`reflection`] — the gRPC Server Reflection Protocol (`grpc.reflection.v1`),
//!   walking the dependency graph over a single bidirectional stream.
//! * [`disk`] — local `.proto` files compiled with an external `protoc`.
//!
//! Both produce a `FileDescriptorSet` which is loaded into a
//! [`DescriptorRegistry`], the lookup structure the rest of the crate works
//! against.
pub mod disk;
pub mod reflection;

use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorSet;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Reflection(#[from] reflection::ReflectionResolveError),
    #[error(transparent)]
    Compile(#[from] disk::ProtoCompileError),
    #[error("failed to build a descriptor pool from the resolved schema: '{0}'")]
    Descriptors(#[from] prost_reflect::DescriptorError),
}

/// A resolved schema with lookup helpers for services and methods.
#[derive(Debug, Clone)]
pub struct DescriptorRegistry {
    pool: DescriptorPool,
}

impl DescriptorRegistry {
    pub fn from_file_descriptor_set(set: FileDescriptorSet) -> Result<Self, SchemaError> {
        let pool = DescriptorPool::from_file_descriptor_set(set)?;
        Ok(Self { pool })
    }

    /// Loads a registry from an encoded `FileDescriptorSet`.
    pub fn decode(bytes: &[u8]) -> Result<Self, SchemaError> {
        let pool = DescriptorPool::decode(bytes)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// All services in the schema, sorted by fully qualified name.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<_> = self.pool.services().collect();
        services.sort_by(|a, b| a.full_name().cmp(b.full_name()));
        services
    }

    pub fn find_service(&self, full_name: &str) -> Option<ServiceDescriptor> {
        self.pool.get_service_by_name(full_name)
    }

    /// Looks up a method by gRPC path (`/package.Service/Method`); a missing
    /// leading slash is tolerated.
    pub fn find_method(&self, path: &str) -> Option<MethodDescriptor> {
        let (service, method) = path.trim_start_matches('/').rsplit_once('/')?;
        self.pool
            .get_service_by_name(service)?
            .methods()
            .find(|m| m.name() == method)
    }
}

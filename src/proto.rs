//! Generated protobuf/gRPC bindings for the CARISMA wire contracts.

pub mod node {
    pub mod v1 {
        tonic::include_proto!("carisma.node.v1");
    }
}

pub mod service {
    pub mod v1 {
        tonic::include_proto!("carisma.service.v1");
    }
}

pub mod xds {
    pub mod v1 {
        tonic::include_proto!("carisma.xds.v1");
    }
}

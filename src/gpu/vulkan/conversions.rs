use ash::vk;

use crate::gpu::structs::{CullMode, DepthFunc, FillMode, FrontFace, Topology};

impl From<CullMode> for vk::CullModeFlags {
    fn from(mode: CullMode) -> Self {
        match mode {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

impl From<Topology> for vk::PrimitiveTopology {
    fn from(topology: Topology) -> Self {
        match topology {
            Topology::Point => vk::PrimitiveTopology::POINT_LIST,
            Topology::Line => vk::PrimitiveTopology::LINE_LIST,
            Topology::Triangle => vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }
}

impl From<FillMode> for vk::PolygonMode {
    fn from(mode: FillMode) -> Self {
        match mode {
            FillMode::Fill => vk::PolygonMode::FILL,
            FillMode::Line => vk::PolygonMode::LINE,
            FillMode::Point => vk::PolygonMode::POINT,
        }
    }
}

impl From<FrontFace> for vk::FrontFace {
    fn from(face: FrontFace) -> Self {
        match face {
            FrontFace::Cw => vk::FrontFace::CLOCKWISE,
            FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

impl From<DepthFunc> for vk::CompareOp {
    fn from(func: DepthFunc) -> Self {
        match func {
            DepthFunc::Never => vk::CompareOp::NEVER,
            DepthFunc::Less => vk::CompareOp::LESS,
            DepthFunc::Equal => vk::CompareOp::EQUAL,
            DepthFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            DepthFunc::Greater => vk::CompareOp::GREATER,
            DepthFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
            DepthFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            DepthFunc::Always => vk::CompareOp::ALWAYS,
        }
    }
}

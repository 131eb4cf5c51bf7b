//! Name resolution for calls inside expression graphs.
//!
//! A call node carries only a symbol name. Before lowering, the name is resolved
//! either to a built-in [`Intrinsic`] or to another [`Lambda`] whose body is inlined
//! with its parameters bound to the call arguments.

use std::collections::HashMap;
use std::sync::Arc;

use super::lambda::Lambda;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BsdfNode {
    DiffuseReflection,
    DiffuseTransmission,
    Specular,
    SimpleGlossy,
    Measured,
    Tint,
    WeightedLayer,
}

impl BsdfNode {
    pub fn runtime_name(self) -> &'static str {
        match self {
            BsdfNode::DiffuseReflection => "diffuse_reflection",
            BsdfNode::DiffuseTransmission => "diffuse_transmission",
            BsdfNode::Specular => "specular",
            BsdfNode::SimpleGlossy => "simple_glossy",
            BsdfNode::Measured => "measured",
            BsdfNode::Tint => "tint",
            BsdfNode::WeightedLayer => "weighted_layer",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Less,
    LessEqual,
    Greater,
    Equal,
    And,
    Or,
    Not,
    Select,
    Min,
    Max,
    Clamp,
    Lerp,
    Pow,
    Sin,
    Cos,
    Sqrt,
    Abs,
    Floor,
    Saturate,
    Dot,
    Cross,
    Normalize,
    Length,
    /// Build a value of the call's return type from its arguments.
    Construct,
    /// Select a child (vector component, struct field, array element).
    Member(u32),
    StateNormal,
    StatePosition,
    StateObjectPosition,
    StateObjectNormal,
    StateObjectId,
    StateTextureCoordinate,
    StateDirection,
    StateAnimationTime,
    TexLookupFloat,
    TexLookupFloat3,
    TexLookupColor,
    TexWidth,
    TexHeight,
    TexDepth,
    TexIsValid,
    LightProfilePower,
    LightProfileMaximum,
    LightProfileIsValid,
    BsdfMeasurementIsValid,
    Bsdf(BsdfNode),
}

impl Intrinsic {
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(index) = name.strip_prefix("member:") {
            return index.parse().ok().map(Intrinsic::Member);
        }
        let i = match name {
            "math::add" => Intrinsic::Add,
            "math::sub" => Intrinsic::Sub,
            "math::mul" => Intrinsic::Mul,
            "math::div" => Intrinsic::Div,
            "math::neg" => Intrinsic::Neg,
            "math::less" => Intrinsic::Less,
            "math::less_equal" => Intrinsic::LessEqual,
            "math::greater" => Intrinsic::Greater,
            "math::equal" => Intrinsic::Equal,
            "math::and" => Intrinsic::And,
            "math::or" => Intrinsic::Or,
            "math::not" => Intrinsic::Not,
            "math::select" => Intrinsic::Select,
            "math::min" => Intrinsic::Min,
            "math::max" => Intrinsic::Max,
            "math::clamp" => Intrinsic::Clamp,
            "math::lerp" => Intrinsic::Lerp,
            "math::pow" => Intrinsic::Pow,
            "math::sin" => Intrinsic::Sin,
            "math::cos" => Intrinsic::Cos,
            "math::sqrt" => Intrinsic::Sqrt,
            "math::abs" => Intrinsic::Abs,
            "math::floor" => Intrinsic::Floor,
            "math::saturate" => Intrinsic::Saturate,
            "math::dot" => Intrinsic::Dot,
            "math::cross" => Intrinsic::Cross,
            "math::normalize" => Intrinsic::Normalize,
            "math::length" => Intrinsic::Length,
            "construct" => Intrinsic::Construct,
            "state::normal" => Intrinsic::StateNormal,
            "state::position" => Intrinsic::StatePosition,
            "state::object_position" => Intrinsic::StateObjectPosition,
            "state::object_normal" => Intrinsic::StateObjectNormal,
            "state::object_id" => Intrinsic::StateObjectId,
            "state::texture_coordinate" => Intrinsic::StateTextureCoordinate,
            "state::direction" => Intrinsic::StateDirection,
            "state::animation_time" => Intrinsic::StateAnimationTime,
            "tex::lookup_float" => Intrinsic::TexLookupFloat,
            "tex::lookup_float3" => Intrinsic::TexLookupFloat3,
            "tex::lookup_color" => Intrinsic::TexLookupColor,
            "tex::width" => Intrinsic::TexWidth,
            "tex::height" => Intrinsic::TexHeight,
            "tex::depth" => Intrinsic::TexDepth,
            "tex::texture_isvalid" => Intrinsic::TexIsValid,
            "df::light_profile_power" => Intrinsic::LightProfilePower,
            "df::light_profile_maximum" => Intrinsic::LightProfileMaximum,
            "df::light_profile_isvalid" => Intrinsic::LightProfileIsValid,
            "df::bsdf_measurement_isvalid" => Intrinsic::BsdfMeasurementIsValid,
            "df::diffuse_reflection_bsdf" => Intrinsic::Bsdf(BsdfNode::DiffuseReflection),
            "df::diffuse_transmission_bsdf" => Intrinsic::Bsdf(BsdfNode::DiffuseTransmission),
            "df::specular_bsdf" => Intrinsic::Bsdf(BsdfNode::Specular),
            "df::simple_glossy_bsdf" => Intrinsic::Bsdf(BsdfNode::SimpleGlossy),
            "df::measured_bsdf" => Intrinsic::Bsdf(BsdfNode::Measured),
            "df::tint" => Intrinsic::Bsdf(BsdfNode::Tint),
            "df::weighted_layer" => Intrinsic::Bsdf(BsdfNode::WeightedLayer),
            _ => return None,
        };
        Some(i)
    }
}

#[derive(Clone, Debug)]
pub enum Resolution {
    Intrinsic(Intrinsic),
    Fragment(Arc<Lambda>),
}

/// Maps called symbol names to their fragments or semantics.
///
/// Must answer identically for the same name during one compile.
pub trait NameResolver {
    fn resolve(&self, name: &str) -> Option<Resolution>;
}

/// Resolves the built-in intrinsics plus any registered user fragments.
/// User fragments shadow intrinsics of the same name.
#[derive(Clone, Debug, Default)]
pub struct StandardResolver {
    fragments: HashMap<String, Arc<Lambda>>,
}

impl StandardResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fragment(&mut self, name: impl Into<String>, fragment: Lambda) {
        self.fragments.insert(name.into(), Arc::new(fragment));
    }
}

impl NameResolver for StandardResolver {
    fn resolve(&self, name: &str) -> Option<Resolution> {
        if let Some(f) = self.fragments.get(name) {
            return Some(Resolution::Fragment(f.clone()));
        }
        Intrinsic::from_name(name).map(Resolution::Intrinsic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_indices_parse() {
        assert_eq!(Intrinsic::from_name("member:2"), Some(Intrinsic::Member(2)));
        assert_eq!(Intrinsic::from_name("member:x"), None);
    }

    #[test]
    fn user_fragments_shadow_intrinsics() {
        use crate::codegen::ExecutionContext;

        let mut r = StandardResolver::new();
        assert!(matches!(r.resolve("math::sin"), Some(Resolution::Intrinsic(Intrinsic::Sin))));
        r.register_fragment("math::sin", Lambda::new("my_sin", ExecutionContext::Core));
        assert!(matches!(r.resolve("math::sin"), Some(Resolution::Fragment(_))));
        assert!(r.resolve("unknown::fn").is_none());
    }
}

use crate::types::{ImageId, Role};
use crate::SchemaError;

/// How a logical image is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSpec {
    /// Built directly from `builder-<builder_dir>` with its build script.
    Direct { builder_dir: String },
    /// Produced by running a provisioning script on top of a start point.
    Provisioned { script: String, start: StartPoint },
}

impl ImageSpec {
    pub fn is_provisioned(&self) -> bool {
        matches!(self, ImageSpec::Provisioned { .. })
    }
}

/// Where a provisioning run starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    /// A shared builder (expanded to `<builder_prefix><name>`).
    Builder(Role),
    /// A concrete existing image.
    Image(ImageId),
}

impl StartPoint {
    /// Exactly one of `builder` and `start_image` must be supplied.
    pub fn from_options(
        builder: Option<Role>,
        start_image: Option<ImageId>,
    ) -> Result<Self, SchemaError> {
        match (builder, start_image) {
            (Some(builder), None) => Ok(StartPoint::Builder(builder)),
            (None, Some(image)) => Ok(StartPoint::Image(image)),
            (Some(_), Some(_)) => Err(SchemaError::InvalidArgument(
                "only one of 'builder' and 'start_image' may be defined".to_owned(),
            )),
            (None, None) => Err(SchemaError::InvalidArgument(
                "one of 'builder' or 'start_image' must be defined".to_owned(),
            )),
        }
    }
}

/// Role of the shared builder image for a provisioning builder name.
pub fn builder_role(prefix: &str, builder: &str) -> Role {
    Role::new(format!("{prefix}{builder}"))
}

/// Directory (relative to the builders dir) holding a builder's build script.
pub fn builder_dir_name(builder_dir: &str) -> String {
    format!("builder-{builder_dir}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_point_requires_exactly_one() {
        assert_eq!(
            StartPoint::from_options(Some(Role::from("centos7")), None).unwrap(),
            StartPoint::Builder(Role::from("centos7"))
        );
        assert_eq!(
            StartPoint::from_options(None, Some(ImageId::from("abc"))).unwrap(),
            StartPoint::Image(ImageId::from("abc"))
        );
        assert!(matches!(
            StartPoint::from_options(None, None),
            Err(SchemaError::InvalidArgument(_))
        ));
        assert!(matches!(
            StartPoint::from_options(Some(Role::from("a")), Some(ImageId::from("b"))),
            Err(SchemaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn builder_naming() {
        assert_eq!(builder_role("ansible-", "centos7"), "ansible-centos7");
        assert_eq!(builder_dir_name("ansible-centos7"), "builder-ansible-centos7");
    }
}

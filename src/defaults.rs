pub fn default_pool_size() -> i32 {
    3
}

pub fn default_false() -> bool {
    false
}

pub fn default_effect() -> String {
    "Allow".to_string()
}

/// Instance type used to force per-region activation, with its fallback for
/// regions that do not carry the first choice.
pub fn default_region_init_instance_types() -> (&'static str, &'static str) {
    ("t3.micro", "t2.micro")
}

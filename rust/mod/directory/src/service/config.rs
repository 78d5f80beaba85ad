/// Configuration for the directory service.
///
/// All DNs are given as written in the directory; they are normalized on use.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Base DN searched for people.
    pub people_dn: String,
    /// Base DN searched for companies.
    pub companies_dn: String,
    /// Base DN searched for groups, and default scope of new groups.
    pub groups_dn: String,
    /// DN of the synthetic, always locked, company isolated users are moved to.
    pub quarantine_dn: String,

    pub people_class: String,
    pub company_class: String,
    pub group_class: String,

    /// Attribute holding the login.
    pub uid_attribute: String,
    /// Multi-valued group membership attribute.
    pub member_attribute: String,
    pub department_attribute: String,
    pub local_id_attribute: String,

    /// Attribute holding the lock marker.
    pub locked_attribute: String,
    /// Leading flag of the lock marker.
    pub locked_value: String,

    /// Pattern matched against a user's full DN to find its company: either
    /// with one capturing group holding the company, or a constant.
    pub company_pattern: String,

    /// Graph lifetime in seconds; 0 keeps it until explicitly invalidated.
    pub cache_ttl: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            people_dn: "ou=people,dc=sample,dc=com".to_string(),
            companies_dn: "ou=people,dc=sample,dc=com".to_string(),
            groups_dn: "ou=groups,dc=sample,dc=com".to_string(),
            quarantine_dn: "ou=quarantine,ou=people,dc=sample,dc=com".to_string(),
            people_class: "inetOrgPerson".to_string(),
            company_class: "organizationalUnit".to_string(),
            group_class: "groupOfUniqueNames".to_string(),
            uid_attribute: "uid".to_string(),
            member_attribute: "uniqueMember".to_string(),
            department_attribute: "employeeNumber".to_string(),
            local_id_attribute: "employeeID".to_string(),
            locked_attribute: "employeeType".to_string(),
            locked_value: "LOCKED".to_string(),
            company_pattern: "[^,]+,ou=([^,]+),.*".to_string(),
            cache_ttl: 0,
        }
    }
}

impl DirectoryConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Flags are named after the fields: `--people-dn=`, `--companies-dn=`,
    /// `--groups-dn=`, `--quarantine-dn=`, `--people-class=`,
    /// `--company-class=`, `--group-class=`, `--uid-attribute=`,
    /// `--member-attribute=`, `--department-attribute=`,
    /// `--local-id-attribute=`, `--locked-attribute=`, `--locked-value=`,
    /// `--company-pattern=`, `--cache-ttl=`. Unknown flags are ignored; an
    /// unparsable TTL keeps the default.
    pub fn from_args(args: &[String]) -> Self {
        let mut config = DirectoryConfig::default();

        for arg in args {
            let Some((flag, val)) = arg.split_once('=') else {
                continue;
            };
            let val = val.to_string();
            match flag {
                "--people-dn" => config.people_dn = val,
                "--companies-dn" => config.companies_dn = val,
                "--groups-dn" => config.groups_dn = val,
                "--quarantine-dn" => config.quarantine_dn = val,
                "--people-class" => config.people_class = val,
                "--company-class" => config.company_class = val,
                "--group-class" => config.group_class = val,
                "--uid-attribute" => config.uid_attribute = val,
                "--member-attribute" => config.member_attribute = val,
                "--department-attribute" => config.department_attribute = val,
                "--local-id-attribute" => config.local_id_attribute = val,
                "--locked-attribute" => config.locked_attribute = val,
                "--locked-value" => config.locked_value = val,
                "--company-pattern" => config.company_pattern = val,
                "--cache-ttl" => {
                    if let Ok(ttl) = val.parse() {
                        config.cache_ttl = ttl;
                    }
                }
                _ => {}
            }
        }

        config
    }
}

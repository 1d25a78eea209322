use kube::CustomResourceExt;
use operator::apis::{
    claim_types::AccountClaim,
    cloudaccount_types::CloudAccount,
    federated_types::{FederatedAccess, FederatedRole},
    pool_types::AccountPool,
};

fn main() {
    let crds = [
        serde_yaml::to_string(&CloudAccount::crd()).unwrap(),
        serde_yaml::to_string(&AccountClaim::crd()).unwrap(),
        serde_yaml::to_string(&AccountPool::crd()).unwrap(),
        serde_yaml::to_string(&FederatedRole::crd()).unwrap(),
        serde_yaml::to_string(&FederatedAccess::crd()).unwrap(),
    ];
    for crd in crds {
        println!("---");
        print!("{crd}");
    }
}

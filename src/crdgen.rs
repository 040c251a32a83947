use controller::apis::{
    cloudstorage_types::CloudStorage, dpa_types::DataProtectionApplication,
};
use kube::CustomResourceExt;

fn main() {
    let dpa = serde_yaml::to_string(&DataProtectionApplication::crd()).unwrap();
    let cs = serde_yaml::to_string(&CloudStorage::crd()).unwrap();
    print!("{dpa}---\n{cs}");
}
